/**
 * Device control
 *
 * Resolves a device by id, toggles DP 1, and tails the event stream for
 * a few seconds. Fill in your own id and key before running.
 */
use futures_util::StreamExt;
use lantuya::{DeviceBuilder, DeviceEvent, GetOptions};
use tokio::time::{Duration, timeout};

#[tokio::main]
async fn main() -> lantuya::Result<()> {
    env_logger::init();

    let device = DeviceBuilder::new()
        .id("DEVICE_ID")
        .key("DEVICE_KEY_16BYTE")
        .version("3.3".parse()?)
        .build()?;

    println!("[STEP 1] Resolving ip from broadcasts...");
    let found = device.find().await?;
    println!("[INFO] Found {} at {}", found.id, found.ip);

    println!("[STEP 2] Current state of DP 1...");
    let state = device.get(GetOptions::default()).await?;
    println!("[INFO] DP 1 = {state}");

    println!("[STEP 3] Toggling DP 1...");
    let new_state = device.toggle(1).await?;
    println!("[INFO] DP 1 is now {new_state}");

    println!("[STEP 4] Tailing events for 10 seconds...");
    let events = device.events();
    tokio::pin!(events);
    let _ = timeout(Duration::from_secs(10), async {
        while let Some(event) = events.next().await {
            match event {
                DeviceEvent::Data { payload, .. } => println!("[DATA] {payload}"),
                DeviceEvent::DpRefresh { payload, .. } => println!("[DP-REFRESH] {payload}"),
                DeviceEvent::Heartbeat => println!("[HEARTBEAT]"),
                other => println!("[EVENT] {other:?}"),
            }
        }
    })
    .await;

    device.disconnect().await?;
    Ok(())
}
