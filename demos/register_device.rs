//! Registers a device with the provisioning service using a symmetric key.
//!
//! Expects `PROVISIONING_HOST`, `PROVISIONING_IDSCOPE`,
//! `PROVISIONING_REGISTRATION_ID` and `PROVISIONING_SYMMETRIC_KEY` in the
//! environment.

use aziot_device_sdk::auth::SymmetricKeySecurityClient;
use aziot_device_sdk::provisioning::{RegistrationClient, RegistrationResult};

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let provisioning_host = std::env::var("PROVISIONING_HOST")?;
    let id_scope = std::env::var("PROVISIONING_IDSCOPE")?;
    let registration_id = std::env::var("PROVISIONING_REGISTRATION_ID")?;
    let symmetric_key = std::env::var("PROVISIONING_SYMMETRIC_KEY")?;

    let security = SymmetricKeySecurityClient::new(registration_id, symmetric_key, id_scope);
    let client = RegistrationClient::from_security_client(&provisioning_host, security, "mqtt")?;

    client.on_registration_complete(|topic, payload| {
        println!("Response on {topic}");
        match RegistrationResult::from_payload(payload) {
            Ok(result) => println!(
                "Operation {} is {}",
                result.operation_id, result.status
            ),
            Err(_) => println!("{}", String::from_utf8_lossy(payload)),
        }
    });

    client.register()?;
    println!("Registration request acknowledged, waiting for responses...");
    std::thread::sleep(std::time::Duration::from_secs(10));

    client.disconnect()?;
    println!("Done.");
    Ok(())
}
