use anyhow::Context;
use bluetooth_chat::domain::settings::SettingsService;
use bluetooth_chat::infrastructure::bluetooth::{
    BluetoothSession, LoopbackRadio, SessionConfig, StaticPermissions,
};
use bluetooth_chat::infrastructure::logging;
use bluetooth_chat::{ConnectionState, DeviceListEntry, Message};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

const STEP_TIMEOUT: Duration = Duration::from_secs(5);

async fn wait_for<T>(
    rx: &mut watch::Receiver<T>,
    what: &str,
    pred: impl FnMut(&T) -> bool,
) -> anyhow::Result<()> {
    tokio::time::timeout(STEP_TIMEOUT, rx.wait_for(pred))
        .await
        .with_context(|| format!("timed out waiting for {}", what))?
        .with_context(|| format!("session closed while waiting for {}", what))?;
    Ok(())
}

fn print_devices(owner: &str, devices: &[DeviceListEntry]) {
    println!("{}'s device list:", owner);
    for entry in devices {
        match entry {
            DeviceListEntry::Section(title) => println!("  [{}]", title),
            DeviceListEntry::DeviceRow(device) => {
                println!("    {} ({})", device.display_name(), device.address)
            }
        }
    }
}

fn print_transcript(owner: &str, messages: &[Message]) {
    println!("{}'s transcript:", owner);
    for message in messages {
        let marker = if message.origin_local() { ">" } else { "<" };
        println!("  {} {}: {}", marker, message.sender_label(), message.body());
    }
}

/// Two loopback nodes chatting over the in-process radio.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings_service = SettingsService::new()?;
    let settings = settings_service.get().clone();
    let _logging_guard = logging::init_logger(&settings.log_settings)
        .map_err(|e| eprintln!("Failed to initialize logger: {}", e))
        .ok();
    info!(
        "Starting Bluetooth chat demo (settings at {})",
        settings_service.path().display()
    );

    let radio = LoopbackRadio::new();
    let permissions = Arc::new(StaticPermissions::granted());
    let (alice_adapter, alice_events) = radio.attach("00:11:22:33:44:01", Some("Alice"));
    let (bob_adapter, bob_events) = radio.attach("00:11:22:33:44:02", Some("Bob"));
    radio.attach("00:11:22:33:44:03", Some("Printer"));
    bob_adapter.bond(alice_adapter.device());

    let config = SessionConfig::from_settings(&settings);
    let alice = BluetoothSession::spawn(
        alice_adapter.clone(),
        permissions.clone(),
        alice_events,
        config.clone(),
    );
    // The configured local name only applies to Alice.
    let bob = BluetoothSession::spawn(
        bob_adapter,
        permissions,
        bob_events,
        SessionConfig {
            local_name: None,
            ..config.clone()
        },
    );

    bob.start_discovery()?;
    let mut bob_devices = bob.devices();
    wait_for(&mut bob_devices, "discovery", |list| list.len() >= 4).await?;
    print_devices("Bob", &bob_devices.borrow());

    alice.wait_for_incoming()?;
    let mut alice_state = alice.connection_state();
    wait_for(&mut alice_state, "listener", |s| *s == ConnectionState::Listening).await?;
    tokio::time::timeout(STEP_TIMEOUT, async {
        while !radio.has_listener(alice_adapter.address(), config.service_id) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .context("timed out waiting for Alice's acceptor")?;

    bob.connect(alice_adapter.address())?;
    let mut bob_state = bob.connection_state();
    wait_for(&mut bob_state, "connection", |s| *s == ConnectionState::Connected).await?;
    wait_for(&mut alice_state, "peer", |s| *s == ConnectionState::Connected).await?;

    bob.send("Hi Alice, can you hear me?")?;
    let mut alice_messages = alice.messages();
    wait_for(&mut alice_messages, "Bob's message", |log| log.len() == 1).await?;
    alice.send("Loud and clear.")?;
    let mut bob_messages = bob.messages();
    wait_for(&mut bob_messages, "Alice's reply", |log| log.len() == 2).await?;

    bob.disconnect()?;
    wait_for(&mut alice_state, "hang-up", |s| *s == ConnectionState::Idle).await?;

    print_transcript("Alice", &alice.messages().borrow());
    print_transcript("Bob", &bob.messages().borrow());

    alice.release().await?;
    bob.release().await?;
    info!("Demo finished");
    Ok(())
}
