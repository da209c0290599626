//! # Gateway Drill
//!
//! Runs a simulated two-machine plant through the gateway: registration,
//! polling, a dropped link on one controller, a restart from the stored
//! sessions and a program upload. Prints what the sink received.

use std::sync::Arc;
use std::time::Duration;

use lib_gateway::connections::{ChannelSink, InMemoryRepository};
use lib_gateway::core::GatewaySettings;
use lib_gateway::driver::{SimMachine, SimulatedDriver};
use lib_gateway::{DriverRuntime, GatewayService, Snapshot};
use tokio::sync::mpsc;
use tokio::time::sleep;

const MILL: &str = "10.0.0.5:8193";
const LATHE: &str = "10.0.0.6:8193";

/// Prints every payload received during `window`.
async fn drain(rx: &mut mpsc::Receiver<(String, bytes::Bytes)>, window: Duration) -> usize {
    let deadline = tokio::time::Instant::now() + window;
    let mut count = 0;
    while let Ok(Some((key, payload))) = tokio::time::timeout_at(deadline, rx.recv()).await {
        count += 1;
        match serde_json::from_slice::<Snapshot>(&payload) {
            Ok(s) => println!(
                "    {key} -> {} {:?} alarms={} axes={} parts={}",
                s.machine_id,
                s.state.machine_state,
                s.alarms.len(),
                s.axes.len(),
                s.parts_count
            ),
            Err(e) => println!("    {key} -> undecodable payload: {e}"),
        }
    }
    count
}

fn build(driver: &Arc<SimulatedDriver>, repo: &Arc<InMemoryRepository>) -> (Arc<GatewayService>, mpsc::Receiver<(String, bytes::Bytes)>) {
    let (sink, rx) = ChannelSink::new(128);
    let runtime = Arc::new(DriverRuntime::new(driver.clone(), "./focas2.log"));
    let service = Arc::new(GatewayService::new(
        runtime,
        repo.clone(),
        Arc::new(sink),
        GatewaySettings::default(),
    ));
    (service, rx)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("lib_gateway=info").init();

    let driver = Arc::new(SimulatedDriver::new());
    driver.add_machine(MILL, SimMachine::new("0i-F"));
    driver.add_machine(LATHE, SimMachine::new("31i-B"));
    let repo = Arc::new(InMemoryRepository::new());

    let (service, mut rx) = build(&driver, &repo);
    service.start().await?;

    println!("[*] Registering controllers...");
    let mill = service.create_connection(MILL).await?;
    let lathe = service.create_connection(LATHE).await?;
    println!("    mill  = {}", mill.session_id);
    println!("    lathe = {}", lathe.session_id);

    service.start_polling(&mill.session_id, 500).await?;
    service.start_polling(&lathe.session_id, 1000).await?;
    println!("[*] Polling for 3s...");
    let received = drain(&mut rx, Duration::from_secs(3)).await;
    println!("[INFO] {received} payload(s)");

    println!("[*] Taking the lathe off the network for 3s...");
    driver.set_reachable(LATHE, false);
    let received = drain(&mut rx, Duration::from_secs(3)).await;
    let lathe_now = service.get_connection(&lathe.session_id).await?;
    println!("[INFO] {received} payload(s), lathe healthy = {}", lathe_now.is_healthy);
    driver.set_reachable(LATHE, true);
    drain(&mut rx, Duration::from_secs(2)).await;

    println!("[*] Restarting the gateway on the same store...");
    service.shutdown().await;
    let (service, mut rx) = build(&driver, &repo);
    let report = service.start().await?;
    println!("[INFO] {}", serde_json::to_string(&report)?);
    drain(&mut rx, Duration::from_secs(2)).await;

    println!("[*] Uploading the mill's active program...");
    match service.read_control_program(&mill.session_id).await {
        Ok(program) => {
            println!("\n[SUCCESS] {} (O{}):", program.name, program.number);
            println!("-----------------------------------------------");
            println!("{}", program.g_code);
            println!("-----------------------------------------------");
        }
        Err(e) => {
            eprintln!("\n[ERROR] Program upload failed:");
            eprintln!(">>> {}", e);
            std::process::exit(1);
        }
    }

    service.shutdown().await;
    Ok(())
}
