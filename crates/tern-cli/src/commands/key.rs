use tern_core::crypto::KeyRing;
use tern_core::sync::KeyRotation;

use crate::commands::common::{
    open_engine, read_secret, Context, EngineMode, NEW_SECRET_ENV, SECRET_ENV,
};
use crate::error::CliError;

pub async fn run_key_init(context: &Context) -> Result<(), CliError> {
    let opened = open_engine(context, EngineMode::Local).await?;
    if let Some(ring) = opened.key_ring {
        println!("{}", ring.current().id());
        return Ok(());
    }

    let secret = read_secret(SECRET_ENV, "Master secret")?;
    let ring = KeyRing::unlock_or_initialize(
        &opened.keys,
        secret.as_bytes(),
        opened.engine.config().kdf_iterations,
    )?;
    println!("{}", ring.current().id());
    Ok(())
}

pub async fn run_key_status(context: &Context) -> Result<(), CliError> {
    let opened = open_engine(context, EngineMode::Local).await?;
    match opened.key_ring {
        Some(ring) if ring.is_rotating() => {
            println!("{} (rotation unfinished; run `tern key rotate`)", ring.current().id());
        }
        Some(ring) => println!("{}", ring.current().id()),
        None => println!("No master key stored for this device."),
    }
    Ok(())
}

/// Re-wrap everything under a new key.
///
/// The previous key stays in the keychain until the remote holds no copy
/// wrapped by it and nothing is pending, so an interrupted rotation can be
/// resumed by running the command again.
pub async fn run_key_rotate(context: &Context) -> Result<(), CliError> {
    let opened = open_engine(context, EngineMode::Sync).await?;
    let ring = opened.key_ring.ok_or(CliError::KeyNotInitialized)?;

    let next = if ring.is_rotating() {
        tracing::info!(key_id = %ring.current().id(), "Resuming unfinished key rotation");
        ring
    } else {
        let secret = read_secret(NEW_SECRET_ENV, "New master secret")?;
        ring.begin_rotation(
            &opened.keys,
            secret.as_bytes(),
            opened.engine.config().kdf_iterations,
        )?
    };

    let rotation = opened.engine.rotate_master_key(next.clone()).await?;
    println!(
        "Re-wrapped {} queued and {} remote records under {}",
        rotation.rewrapped,
        rotation.remote_rewrapped,
        next.current().id()
    );

    opened.engine.sync_now().await?;
    let pending = opened.engine.status().await?.pending;
    ensure_rotation_complete(&rotation, pending)?;

    next.finish_rotation(&opened.keys)?;
    println!("Rotation finished; previous key removed");
    Ok(())
}

/// The previous key may only be dropped once nothing still depends on it
pub fn ensure_rotation_complete(rotation: &KeyRotation, pending: usize) -> Result<(), CliError> {
    if pending > 0 || rotation.remaining > 0 {
        return Err(CliError::RotationUnfinished {
            pending,
            remaining: rotation.remaining,
        });
    }
    Ok(())
}
