use async_trait::async_trait;
use enum_dispatch::enum_dispatch;

use crate::error::DeterrentError;
use crate::messages::AlertEvent;

use super::{NotifyChannel, SoundChannel, StoreChannel};

/// One independent side effect of a triggered alert.
#[async_trait]
#[enum_dispatch(ChannelType)]
pub trait AlertChannel {
    async fn deliver(&self, alert: &AlertEvent) -> Result<(), DeterrentError>;

    fn name(&self) -> &'static str;
}

#[enum_dispatch]
#[derive(Clone)]
pub enum ChannelType {
    StoreChannel(StoreChannel),
    SoundChannel(SoundChannel),
    NotifyChannel(NotifyChannel),
}
