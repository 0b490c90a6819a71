//! Channel proxies.

use std::sync::Arc;

use crate::error::Result;
use crate::proxy::{ChannelConfig, ChannelProxy};
use crate::SharedConnection;

impl SharedConnection {
    /// Proxy for channel `name`, registering `config`'s client handlers.
    ///
    /// Calling this again for the same name returns the same proxy with the
    /// new handlers merged in. Fails with `UnknownChannel` when the transport
    /// does not declare the channel.
    pub fn channel_proxy(&self, name: &str, config: ChannelConfig) -> Result<Arc<ChannelProxy>> {
        self.inner.channel_proxy(name, config)
    }
}
