//! Frame chains and swap objects

pub mod framechain;
pub mod swapchain;

pub use framechain::{
    FrameChain, FrameChainDesc, FrameRing, FrameTarget, ImageRole, ImageSet, SlotCommands, SURFACE_COLOR_ROLE,
};
pub use swapchain::SurfaceTarget;
