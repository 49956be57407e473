pub mod cache;
pub mod network;
pub mod service;

pub use service::{
    AppError,
    AppResult,
    ConnContext,
    ConnHandler,
    ConnManager,
    ConnState,
    DisconnectReason,
    FabricConfig,
    ManagerOptions,
    Shutdown,
};
pub use network::{decode_frames, Frame, FrameConfig, FrameDecoder};
pub use cache::TieredCache;
