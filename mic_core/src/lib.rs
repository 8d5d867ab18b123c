pub mod apartment;
pub mod cache;
pub mod coordinator;
pub mod enumerator;
pub mod error;
pub mod meter;
pub mod meter_math;
pub mod notification;
pub mod policy_adapter;
#[cfg(target_os = "windows")]
pub mod policy_config;
pub mod poller;
pub mod scheduling;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod types;
#[cfg(target_os = "windows")]
pub mod win_props;
pub mod volume;

pub use coordinator::{CancelToken, Coordinator, CoreEvent, CoreEventListener, ListenerHandle};
pub use enumerator::{EndpointEnumerator, EndpointQuery};
pub use error::CoreError;
pub use meter::{MeterHandle, MeterListener, MeterReading, MeterSource, SampleFormat};
pub use notification::{NotificationEvent, NotificationHandle, NotificationListener, NotificationSource};
pub use policy_adapter::PolicyAdapter;
pub use scheduling::{NullSchedulingContext, SchedulingContext};
pub use types::{DeviceRole, EndpointId, EndpointSnapshot};
pub use volume::{SubscriptionHandle, VolumeChangeListener, VolumeController};

#[cfg(target_os = "windows")]
pub use enumerator::windows_impl::WindowsEndpointEnumerator;
#[cfg(target_os = "windows")]
pub use meter::windows_impl::WindowsMeterSource;
#[cfg(target_os = "windows")]
pub use notification::windows_impl::WindowsNotificationSource;
#[cfg(target_os = "windows")]
pub use policy_adapter::windows_impl::WindowsPolicyAdapter;
#[cfg(target_os = "windows")]
pub use volume::windows_impl::WindowsVolumeController;
