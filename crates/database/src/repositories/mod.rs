pub mod conversation;
pub mod document;
pub mod memory;
pub mod output_device;
pub mod room;
pub mod settings;

pub use conversation::PgConversationRepository;
pub use document::PgChunkSearchRepository;
pub use memory::PgMemoryRepository;
pub use output_device::PgOutputDeviceRepository;
pub use room::{PgDeviceRepository, PgRoomRepository};
pub use settings::PgSettingsRepository;
