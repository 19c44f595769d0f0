//! unison demo host application
//!
//! The first launch wins the election and prints whatever later launches
//! forward to it. Later launches hand their arguments to the primary and
//! exit, the way a document viewer forwards a file path to the running
//! window.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use unison::{AppIdentity, IdentityOptions, InstanceEvent, Role, SingleInstance};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Keep running alongside the primary instead of exiting
    #[arg(long)]
    secondary: bool,

    /// Scope uniqueness to the current user instead of the whole machine
    #[arg(long)]
    user: bool,

    /// Words forwarded to the primary instance
    #[arg(trailing_var_arg = true)]
    message: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    unison_utils::init_logging()?;

    let args = Args::parse();

    let mut options = IdentityOptions::SECONDARY_NOTIFICATION;
    if args.user {
        options |= IdentityOptions::USER;
    }

    let identity = AppIdentity::new("unison-demo", "unison", "unison.example");
    let mut instance = SingleInstance::elect(
        &identity,
        args.secondary,
        options,
        Duration::from_secs(1),
    )
    .await?;

    match instance.role() {
        Role::Primary => run_primary(instance).await,
        Role::Secondary | Role::Rejected => {
            run_messenger(instance, args.message.join(" ")).await
        }
    }
}

/// Primary: print every event until interrupted.
async fn run_primary(mut instance: SingleInstance) -> Result<()> {
    println!(
        "primary (pid {}) listening on channel {}",
        std::process::id(),
        instance.channel_name()
    );

    let mut events = instance
        .take_events()
        .context("event stream already taken")?;

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Some(InstanceEvent::InstanceStarted) => {
                        println!("another instance started");
                    }
                    Some(InstanceEvent::MessageReceived { instance_id, payload }) => {
                        println!(
                            "instance {} says: {}",
                            instance_id,
                            String::from_utf8_lossy(&payload)
                        );
                    }
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, shutting down");
                break;
            }
        }
    }

    Ok(())
}

/// Non-primary: forward the message, report, and let main return.
async fn run_messenger(mut instance: SingleInstance, message: String) -> Result<()> {
    let primary_pid = instance.primary_pid()?;

    if message.is_empty() {
        println!("primary already running as pid {primary_pid}");
        return Ok(());
    }

    if instance
        .send_message(message.as_bytes(), Duration::from_secs(1))
        .await
    {
        println!("forwarded to primary (pid {primary_pid})");
    } else {
        println!("could not reach the primary");
    }

    Ok(())
}
