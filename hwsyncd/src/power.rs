//! Laptop lid state, used to suppress hardware reads while the lid is closed

use async_trait::async_trait;
use tokio::sync::OnceCell;

const UPOWER_BUS_NAME: &str = "org.freedesktop.UPower";
const UPOWER_PATH: &str = "/org/freedesktop/UPower";
const UPOWER_INTERFACE: &str = "org.freedesktop.UPower";

/// Read-only lid state query
#[async_trait]
pub trait LidMonitor: Send + Sync {
    async fn lid_closed(&self) -> zbus::Result<bool>;
}

/// Lid state from UPower on the system bus
#[derive(Default)]
pub struct UPowerLid {
    proxy: OnceCell<zbus::Proxy<'static>>,
}

impl UPowerLid {
    pub fn new() -> Self {
        Self::default()
    }

    async fn proxy(&self) -> zbus::Result<&zbus::Proxy<'static>> {
        self.proxy
            .get_or_try_init(|| async {
                let connection = zbus::Connection::system().await?;
                zbus::Proxy::new(&connection, UPOWER_BUS_NAME, UPOWER_PATH, UPOWER_INTERFACE).await
            })
            .await
    }
}

#[async_trait]
impl LidMonitor for UPowerLid {
    async fn lid_closed(&self) -> zbus::Result<bool> {
        self.proxy().await?.get_property::<bool>("LidIsClosed").await
    }
}

/// A lid that never changes; `StaticLid(false)` disables lid suppression
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticLid(pub bool);

#[async_trait]
impl LidMonitor for StaticLid {
    async fn lid_closed(&self) -> zbus::Result<bool> {
        Ok(self.0)
    }
}
