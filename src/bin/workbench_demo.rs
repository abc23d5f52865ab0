/// Voltage Modbus Workbench Demo
///
/// Author: Evan Liu <evan.liu@voltageenergy.com>
/// Runs a bus scan, a typed write/read round trip and a slave-mode external
/// write against the in-memory simulated bus. Pass a YAML or JSON config file
/// as the first argument to override the defaults.

use std::sync::Arc;

use anyhow::{Context, Result};
use log::info;
use tokio::sync::{mpsc, Mutex};
use voltage_modbus_workbench::register_store::RegisterDefinition;
use voltage_modbus_workbench::simulator::{SimulatedBus, SlaveBehaviour};
use voltage_modbus_workbench::{
    DataType, DeviceScanner, ModbusMaster, ModbusRegisterBank, ModbusTransport, RegisterKind, RegisterStore, Session,
    SessionUpdate, WorkbenchConfig, WriteDataItem, WriteFunction, WriteRequestBuilder,
};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    println!("🚀 Voltage Modbus Workbench Demo");
    println!("================================");
    println!("{}", voltage_modbus_workbench::info());

    let config = match std::env::args().nth(1) {
        Some(path) => WorkbenchConfig::from_file(&path).with_context(|| format!("loading {}", path))?,
        None => WorkbenchConfig::default(),
    };
    let order = config.word_order();

    // Local register map served in slave mode
    let mut store = RegisterStore::with_word_order(order);
    store.add_register(
        RegisterKind::HoldingRegisters,
        RegisterDefinition::new(10, DataType::UInt32).with_name("energy_total"),
    )?;
    store.add_register(
        RegisterKind::HoldingRegisters,
        RegisterDefinition::new(12, DataType::Float32).with_name("grid_frequency"),
    )?;
    let bank = ModbusRegisterBank::from_store(&store)?;

    let (external_tx, external_rx) = mpsc::unbounded_channel();
    let mut bus = SimulatedBus::new()
        .with_slave(42, SlaveBehaviour::Respond)
        .with_slave(99, SlaveBehaviour::Exception(0x01));
    bus.attach_local(config.local_slave_id, bank.clone(), external_tx);
    bus.connect(&config.connection).await?;
    let transport = Arc::new(Mutex::new(bus));

    let (session, handle, mut updates) = Session::new(store, config.highlight_duration());
    let session = session.with_bank(bank)?;
    let session_task = tokio::spawn(session.run());
    let forward_task = handle.forward_external_writes(external_rx);

    println!("\n🔍 Scanning slave ids {}-{}...", config.scan.first_slave_id, config.scan.last_slave_id);
    let scanner = DeviceScanner::new(config.scan.clone())?;
    let (scan_tx, scan_forwarder) = handle.scan_events();
    let summary = scanner.start(Arc::clone(&transport), scan_tx)?.await??;
    scan_forwarder.await?;
    println!(
        "✅ Scan finished: {} success, {} exception, {} timeout in {:?}",
        summary.success, summary.exception, summary.timeout, summary.elapsed
    );

    println!("\n✏️  Writing a typed batch to slave 42...");
    let master = ModbusMaster::from_shared(Arc::clone(&transport)).with_word_order(order);
    let mut builder = WriteRequestBuilder::new(WriteFunction::MultipleRegisters, 100).with_word_order(order);
    builder
        .push(WriteDataItem::new("230.5", DataType::Float32))
        .push(WriteDataItem::new("-12", DataType::Int16))
        .push(WriteDataItem::new("PUMP", DataType::AsciiString));
    let written = master.write(42, &builder).await?;
    println!("   {} words written", written);

    for (data_type, quantity) in [(DataType::Float32, 2), (DataType::Int16, 1), (DataType::AsciiString, 2)] {
        let address = builder
            .items()
            .iter()
            .find(|item| item.data_type == data_type)
            .map(|item| item.address)
            .unwrap_or(100);
        let items = master
            .read_items(42, RegisterKind::HoldingRegisters, address, quantity, data_type)
            .await?;
        for item in items {
            println!(
                "   {:>5} {:<12} {:<10} [{}] bytes {}",
                item.address,
                item.data_type,
                item.display(),
                item.raw_hex(),
                item.raw_bytes_hex()
            );
        }
    }

    println!("\n📥 Remote master writes 0x00010002 to the local node...");
    let remote = ModbusMaster::from_shared(Arc::clone(&transport));
    let mut remote_batch = WriteRequestBuilder::new(WriteFunction::MultipleRegisters, 10).with_word_order(order);
    remote_batch.push(WriteDataItem::new("65538", DataType::UInt32));
    remote.write(config.local_slave_id, &remote_batch).await?;

    // The remote write arrives as updates; stop once it has been applied
    while let Some(update) = updates.recv().await {
        if let SessionUpdate::Changes(changes) = update {
            info!("{} changes ({:?})", changes.len(), changes.origin());
            println!("   {} field changes from {:?}", changes.len(), changes.origin());
            break;
        }
    }

    transport.lock().await.disconnect().await?;
    handle.shutdown()?;
    forward_task.abort();
    let session = session_task.await?;
    if let Some(entry) = session.store().register(RegisterKind::HoldingRegisters, 10) {
        println!(
            "   {} = {} (recently modified: {})",
            entry.name(),
            entry.display(),
            entry.recently_modified()
        );
    }

    println!("\n🎉 Demo complete");
    Ok(())
}
