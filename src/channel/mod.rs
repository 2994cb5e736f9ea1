pub mod backoff;
pub mod event_channel;
pub mod frame;
pub mod registry;
pub mod state;

pub use event_channel::EventChannel;
pub use frame::{CameraStatusUpdate, CameraSummary, EventFrame, FrameError, SurveillanceEvent, event_types};
pub use registry::{Subscription, SubscriptionHandle, SubscriptionRegistry};
pub use state::{ChannelState, ChannelStatus};
