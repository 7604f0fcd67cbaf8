// This is free and unencumbered software released into the public domain.

mod config;
pub use config::*;

mod dispatcher;
pub use dispatcher::*;

pub mod drivers {
    #[cfg(feature = "simulator")]
    pub mod simulated;
}

mod engine;
pub use engine::*;

mod error;
pub use error::*;

mod event;
pub use event::*;

mod frame;
pub use frame::*;

mod hal;
pub use hal::*;

mod identity;
pub use identity::*;

mod longshot;
pub use longshot::*;

mod media;
pub use media::*;

mod metadata;
pub use metadata::*;

mod open;
pub use open::*;

mod region;
pub use region::*;

mod registry;
pub use registry::*;

mod request;
pub use request::*;

mod runtime;
pub use runtime::*;

mod session;
pub use session::*;

mod settings;
pub use settings::*;

mod state;
pub use state::*;

mod topology;
pub use topology::*;
