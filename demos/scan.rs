/**
 * Discovery sweep
 *
 * Listens for presence broadcasts on the local network and prints every
 * device heard before the timeout.
 */
use lantuya::Discovery;
use tokio::time::Duration;

#[tokio::main]
async fn main() -> lantuya::Result<()> {
    env_logger::init();
    println!("--- Lantuya - Discovery sweep ---");

    let devices = Discovery::new()
        .with_timeout(Duration::from_secs(15))
        .find_all()
        .await?;

    for (n, device) in devices.iter().enumerate() {
        println!(
            "[{}] id={} ip={} version={:?} product_key={:?}",
            n + 1,
            device.id,
            device.ip,
            device.version,
            device.product_key
        );
    }
    println!("[INFO] Sweep finished. {} devices found.", devices.len());
    Ok(())
}
