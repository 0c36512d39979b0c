use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

use cinder_crypto::background::{replenish_prekeys_in_background, unlock_in_background};
use cinder_crypto::{
    Clock, DeviceId, DeviceLock, Envelope, KeyStore, LockPolicy, ProtocolConfig, SessionManager,
    SystemClock,
};
use cinder_demo::FileKeychain;

/// Command-line arguments for the walkthrough.
struct Args {
    dir: PathBuf,
    messages: u32,
    pin: Zeroizing<String>,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = std::env::args().skip(1);
    let mut dir = None;
    let mut messages = 5;
    let mut pin = Zeroizing::new("246810".to_string());

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--dir" => dir = args.next().map(PathBuf::from),
            "--messages" => {
                messages = args
                    .next()
                    .context("--messages needs a value")?
                    .parse()
                    .context("--messages must be a number")?;
            }
            "--pin" => pin = Zeroizing::new(args.next().context("--pin needs a value")?),
            other => bail!("unknown argument {other}"),
        }
    }

    Ok(Args {
        dir: dir.unwrap_or_else(|| std::env::temp_dir().join("cinder-demo")),
        messages,
        pin,
    })
}

/// One simulated device: its own keychain directory, lock and session
/// manager.
struct Device {
    lock: Arc<DeviceLock>,
    manager: Arc<SessionManager>,
}

/// Provision the device on first run, otherwise unlock it and restore its
/// sessions from disk.
async fn open_device(args: &Args, name: &str, clock: &Arc<dyn Clock>) -> anyhow::Result<Device> {
    let keychain = Arc::new(FileKeychain::open(&args.dir.join(name))?);
    let lock = Arc::new(DeviceLock::new(
        keychain.clone(),
        LockPolicy::default(),
        clock.clone(),
    ));
    let store = KeyStore::new(lock.clone(), keychain.clone());
    let id = DeviceId::new(name);

    let manager = if lock.is_provisioned()? {
        unlock_in_background(lock.clone(), args.pin.as_str().to_owned())
            .await
            .with_context(|| format!("unlocking {name}"))?;
        SessionManager::open(id, ProtocolConfig::default(), store, clock.clone())?
    } else {
        if let Some(warning) = lock.policy().wipe_warning() {
            tracing::warn!(device = name, "{warning}");
        }
        lock.provision(&args.pin)?;
        SessionManager::create(id, ProtocolConfig::default(), store, clock.clone())?
    };
    tracing::info!(
        device = name,
        dir = %keychain.root().display(),
        identity = %manager.identity_public_key()?.to_hex(),
        "device ready"
    );

    Ok(Device {
        lock,
        manager: Arc::new(manager),
    })
}

/// Seal on one device, push the bytes through the "network", open on the
/// other.
fn transmit(from: &Device, to: &Device, plaintext: &[u8]) -> anyhow::Result<Vec<u8>> {
    let wire = prepare(from, to, plaintext)?;
    deliver(from, to, &wire)
}

fn prepare(from: &Device, to: &Device, plaintext: &[u8]) -> anyhow::Result<Vec<u8>> {
    let id = from.manager.session_id(to.manager.local_device());
    Ok(from.manager.prepare_message(&id, plaintext)?.encode()?)
}

fn deliver(from: &Device, to: &Device, wire: &[u8]) -> anyhow::Result<Vec<u8>> {
    let envelope = Envelope::decode(wire)?;
    let id = to.manager.session_id(from.manager.local_device());
    Ok(to.manager.deliver_ciphertext(&id, &envelope)?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = parse_args()?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let alice = open_device(&args, "alice", &clock).await?;
    let bob = open_device(&args, "bob", &clock).await?;

    // First contact, unless a previous run already connected them.
    let to_bob = alice.manager.session_id(bob.manager.local_device());
    if !alice.manager.has_session(&to_bob) {
        let bundle = bob.manager.public_bundle()?.take_prekey_bundle();
        alice.manager.initiate(bob.manager.local_device(), &bundle)?;
    }

    let hello = transmit(&alice, &bob, b"hello")?;
    tracing::info!(text = %String::from_utf8_lossy(&hello), "bob received");
    let added = replenish_prekeys_in_background(bob.manager.clone()).await?;
    tracing::info!(added, "bob topped up one-time prekeys");

    let reply = transmit(&bob, &alice, b"hi alice")?;
    tracing::info!(text = %String::from_utf8_lossy(&reply), "alice received");

    // A burst that arrives in reverse order.
    let mut burst = Vec::new();
    for i in 0..args.messages {
        burst.push(prepare(&alice, &bob, format!("message {i}").as_bytes())?);
    }
    for wire in burst.iter().rev() {
        let text = deliver(&alice, &bob, wire)?;
        tracing::info!(text = %String::from_utf8_lossy(&text), "bob received out of order");
    }

    let on_alice = alice.manager.safety_number(bob.manager.local_device())?;
    let on_bob = bob.manager.safety_number(alice.manager.local_device())?;
    println!("safety number (alice): {on_alice}");
    println!("safety number (bob):   {on_bob}");
    alice
        .manager
        .verify_safety_number(bob.manager.local_device(), on_bob.digits())?;

    // Locked devices refuse to touch keys until unlocked again.
    alice.lock.lock();
    if prepare(&alice, &bob, b"while locked").is_ok() {
        bail!("locked device encrypted a message");
    }
    unlock_in_background(alice.lock.clone(), args.pin.as_str().to_owned()).await?;
    let after = transmit(&alice, &bob, b"back again")?;
    tracing::info!(text = %String::from_utf8_lossy(&after), "bob received after unlock");

    println!(
        "state kept in {}; run again to resume the same sessions",
        args.dir.display()
    );
    Ok(())
}
