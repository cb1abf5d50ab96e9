//! Sends a telemetry message and waits for cloud-to-device messages.
//!
//! Expects the device connection string in the `IOTHUB_DEVICE_CONNECTION_STRING`
//! environment variable.

use std::time::Duration;

use aziot_device_sdk::{DeviceClient, Message};

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let connection_string = std::env::var("IOTHUB_DEVICE_CONNECTION_STRING")?;
    let client = DeviceClient::from_connection_string(&connection_string)?;

    client.connect()?;
    println!("Connected.");

    let mut message = Message::from("hello from the device");
    message.message_id = Some("sample-1".to_owned());
    message
        .custom_properties
        .insert("source".to_owned(), "send_telemetry".to_owned());
    client.send_event(message)?;
    println!("Telemetry acknowledged.");

    client.enable_feature("c2d")?;
    println!("Waiting 30 s for a cloud-to-device message...");
    match client.receive_c2d(Some(Duration::from_secs(30))) {
        Some(received) => println!(
            "Received {} byte(s), properties: {:?}",
            received.payload.len(),
            received.custom_properties
        ),
        None => println!("No message arrived."),
    }

    client.disconnect()?;
    Ok(())
}
