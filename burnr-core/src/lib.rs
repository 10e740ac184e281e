//! The core, UI-agnostic library for the `burnr` image burning utility.
//!
//! `burnr-core` is designed to be used as a library by any front-end,
//! whether it's a command-line interface (like `burnr`) or a graphical user
//! interface. Rather than copying bytes itself, it orchestrates the standard
//! Linux tooling: `dd` performs the write under privilege elevation, `lsblk`
//! enumerates devices, and `parted`/`mkfs.*` handle partitioning and
//! formatting. The library supervises those tools, parses their output, and
//! exposes the result as typed state and events.
//!
//! The library is structured into several key modules:
//! - [`engine`]: The [`engine::BurnEngine`] state machine that drives one
//!   image-write job end to end and reports it as [`engine::BurnEvent`]s.
//! - [`registry`]: Device enumeration, unmounting, ejecting, and hot-plug
//!   detection via a background watcher.
//! - [`partition`]: Partition-table creation and filesystem formatting.
//! - [`filesystem`]: The static filesystem profile table with label and
//!   cluster-size rules.
//! - [`image`]: Image inspection and streaming decompression.
//! - [`verify`]: Post-burn checksum verification.
//! - [`process`]: Shared external-process plumbing.
//!
//! ## Example: Burning an Image with Event-Driven Progress
//!
//! ```rust,no_run
//! use burnr_core::engine::{BurnEngine, BurnEvent, BurnJob};
//! use burnr_core::registry::DeviceRegistry;
//! use anyhow::Result;
//!
//! fn main() -> Result<()> {
//!     let registry = DeviceRegistry::new();
//!     let devices = registry.list_removable()?;
//!     let device = devices.first().expect("No removable devices found.");
//!
//!     let (engine, events) = BurnEngine::new();
//!     let job = BurnJob::raw("path/to/image.iso".into(), device.path.clone());
//!     engine.submit(job)?;
//!
//!     // A real app would drive a progress bar from these events.
//!     for event in events {
//!         match event {
//!             BurnEvent::Progress(percent) => println!("{percent}%"),
//!             BurnEvent::Finished { success, message } => {
//!                 println!("{message}");
//!                 if !success {
//!                     std::process::exit(1);
//!                 }
//!                 break;
//!             }
//!             _ => {}
//!         }
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod device;
pub mod engine;
pub mod error;
pub mod filesystem;
pub mod image;
pub mod partition;
pub mod process;
pub mod progress;
pub mod registry;
pub mod verify;

pub use device::DeviceDescriptor;
pub use engine::{BurnEngine, BurnEvent, BurnJob, BurnMode, BurnState};
pub use error::{BurnError, PartitionError, ProcessError, RegistryError, VerifyError};
pub use filesystem::FsKind;
pub use partition::{PartitionFormatter, PartitionScheme};
pub use registry::{DeviceEvent, DeviceRegistry, DeviceWatcher};
