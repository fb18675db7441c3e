pub mod common;
pub mod conversations;
pub mod memory;
pub mod output;
pub mod pipeline;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod retrieval;
pub mod rooms;
pub mod router;
pub mod tools;
pub mod turn;
pub mod wakeword;

pub use output::{AudioOutputService, OutputRouter};
pub use pipeline::AudioPipeline;
pub use presence::PresenceService;
pub use registry::DeviceRegistry;
pub use retrieval::RetrievalEngine;
pub use rooms::RoomService;
pub use router::IntentRouter;
pub use turn::TurnCoordinator;
pub use wakeword::WakeWordBroadcaster;

#[cfg(test)]
pub mod test_utils;
