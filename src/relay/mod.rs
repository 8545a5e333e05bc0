//! Session and routing layer of the video relay
//!
//! Up to [`MAX_CLIENTS`] external clients send encoded video to the relay.
//! Each admitted client gets one internal endpoint (a local socket wired to
//! one compositor input) and one display slot (a cell of the output grid).
//! Whatever the compositor produces is sent back to every client.
//!
//! # Example
//!
//! ```no_run
//! use gridrelay::config::RelayConfig;
//! use gridrelay::relay::{LayoutCompositor, RelayServer};
//!
//! let config = RelayConfig::default();
//! let mut server = RelayServer::bind(&config, LayoutCompositor::new())?;
//! server.run()?;
//! # Ok::<(), gridrelay::RelayError>(())
//! ```

mod compositor;
mod endpoint;
mod identity;
mod server;
mod session;
mod slots;

pub use compositor::{
    CommandWriter, Compositor, CompositorCommand, ControlSocket, GridPoint, InputLayout,
    LayoutCompositor,
};
pub use endpoint::{EndpointPool, InternalEndpoints};
pub use identity::{ClientAddr, EndpointIndex, SlotIndex, MAX_CLIENTS};
pub use server::{RelayServer, RelaySnapshot, RelayStats};
pub use session::{Admission, ClientSession, SessionInfo, SessionTable};
pub use slots::{SlotAllocator, SlotGrid};
