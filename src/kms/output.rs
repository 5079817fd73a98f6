use drm::control::{connector, Mode};
use tracing::{debug, trace, warn};

use super::{
    changes::OutputChanges,
    connector_type_str, default_mode,
    device::{ConnectorInfo, KmsDevice, ObjectId},
    error::Error,
    props::{ConnectorProp, PropertyCache},
    PipeId,
};

/// Configuration of a connector as resolved during the last refresh
#[derive(Debug, Clone, Default)]
pub struct ConnectorConfig {
    /// Connector state, `None` if the driver could not be queried
    pub connector: Option<ConnectorInfo>,
    /// Crtc indices the connector can be driven from
    pub valid_crtc_idx_mask: u32,
    /// Pipe selected for the pending assignment
    pub pipe: Option<PipeId>,
    /// Mode used when the output is enabled
    pub default_mode: Option<Mode>,
    /// Whether a sink is attached
    pub connected: bool,
    /// Property handles of the connector
    pub props: PropertyCache<ConnectorProp>,
}

/// A connector of the device
#[derive(Debug)]
pub struct Output {
    pub(crate) index: usize,
    pub(crate) handle: connector::Handle,
    pub(crate) name: Option<String>,
    pub(crate) pending_crtc_idx_mask: u32,
    pub(crate) config: ConnectorConfig,
    pub(crate) force_reprobe: bool,
    pub(crate) override_mode: Option<Mode>,
    pub(crate) scaling_mode: u64,
    pub(crate) changes: OutputChanges,
}

impl Output {
    pub(crate) fn new(index: usize, handle: connector::Handle) -> Output {
        Output {
            index,
            handle,
            name: None,
            pending_crtc_idx_mask: 0,
            config: ConnectorConfig::default(),
            force_reprobe: true,
            override_mode: None,
            scaling_mode: 0,
            changes: OutputChanges::empty(),
        }
    }

    /// Index of the output in the display
    pub fn index(&self) -> usize {
        self.index
    }

    /// Connector handle
    pub fn handle(&self) -> connector::Handle {
        self.handle
    }

    /// Name such as `HDMI-A-1`, empty until the connector could be queried once
    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or("")
    }

    /// Whether a sink is attached
    pub fn is_connected(&self) -> bool {
        self.config.connected
    }

    /// Resolved configuration
    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    /// Mode the output is going to be driven with
    pub fn mode(&self) -> Option<Mode> {
        self.override_mode.or(self.config.default_mode)
    }

    /// Pipe selected for the output, if any
    pub fn pipe(&self) -> Option<PipeId> {
        self.config.pipe
    }

    /// Pipe requested with [`Display::set_output_pipe`](super::Display::set_output_pipe)
    pub fn pending_pipe(&self) -> Option<PipeId> {
        PipeId::from_mask(self.pending_crtc_idx_mask)
    }

    /// Changes not yet committed
    pub fn changes(&self) -> OutputChanges {
        self.changes
    }

    /// Pending value of the scaling mode property
    pub fn scaling_mode(&self) -> u64 {
        self.scaling_mode
    }

    /// Re-queries the connector and selects the lowest pipe of `crtc_idx_mask` the
    /// connector can be driven from.
    pub(crate) fn refresh(&mut self, dev: &dyn KmsDevice, crtc_idx_mask: u32) -> Result<(), Error> {
        let probe = std::mem::take(&mut self.force_reprobe);
        self.config.pipe = None;

        let info = match dev.connector_info(self.handle, probe) {
            Ok(info) => info,
            Err(err) => {
                warn!(connector = ?self.handle, ?err, "Failed to query connector");
                self.config.connected = false;
                return Ok(());
            }
        };

        if self.name.is_none() {
            let name = format!("{}-{}", connector_type_str(info.interface), info.interface_id);
            debug!(connector = ?self.handle, %name, "naming output");
            self.name = Some(name);
        }

        self.config.valid_crtc_idx_mask = info.possible_crtcs;
        self.config.default_mode = default_mode(&info.modes);
        self.config.connected = info.state == connector::State::Connected;
        self.config.props = PropertyCache::fill(dev, ObjectId::Connector(self.handle))?;
        if self.config.connected && info.modes.is_empty() {
            warn!(output = %self.name(), "connector has no modes");
        }
        self.config.connector = Some(info);

        self.config.pipe = PipeId::from_mask(crtc_idx_mask & self.config.valid_crtc_idx_mask);
        trace!(
            output = %self.name(),
            pipe = ?self.config.pipe,
            connected = self.config.connected,
            "refreshed output"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Output;
    use crate::kms::{
        device::mock::{mode, MockConfig, MockConnector, MockDevice},
        KmsDevice, PipeId,
    };
    use drm::control::connector::Interface;

    fn first_output(dev: &MockDevice) -> Output {
        Output::new(0, dev.resources().unwrap().connectors[0])
    }

    #[test]
    fn names_follow_connector_type() {
        let dev = MockDevice::new(MockConfig {
            connectors: vec![
                MockConnector::new(Interface::HDMIA, true),
                MockConnector::new(Interface::HDMIA, false),
            ],
            ..MockConfig::default()
        });
        let connectors = dev.resources().unwrap().connectors;
        let mut second = Output::new(1, connectors[1]);
        second.refresh(&dev, 0).unwrap();
        assert_eq!(second.name(), "HDMI-A-2");
        assert!(!second.is_connected());
    }

    #[test]
    fn refresh_selects_lowest_valid_pipe() {
        let mut connector = MockConnector::new(Interface::DisplayPort, true);
        connector.possible_crtcs = 0b10;
        let dev = MockDevice::new(MockConfig {
            connectors: vec![connector],
            ..MockConfig::default()
        });
        let mut output = first_output(&dev);
        output.refresh(&dev, 0b11).unwrap();
        assert_eq!(output.pipe(), Some(PipeId(1)));
        output.refresh(&dev, 0b01).unwrap();
        assert_eq!(output.pipe(), None);
    }

    #[test]
    fn override_takes_precedence() {
        let dev = MockDevice::new(MockConfig::default());
        let mut output = first_output(&dev);
        output.refresh(&dev, 0).unwrap();
        assert_eq!(output.mode().unwrap().size(), (1920, 1080));

        output.override_mode = Some(mode(640, 480, 60, false));
        assert_eq!(output.mode().unwrap().size(), (640, 480));
    }

    #[test]
    fn empty_mode_list_leaves_no_mode() {
        let mut connector = MockConnector::new(Interface::Virtual, true);
        connector.modes.clear();
        let dev = MockDevice::new(MockConfig {
            connectors: vec![connector],
            ..MockConfig::default()
        });
        let mut output = first_output(&dev);
        output.refresh(&dev, 0b1).unwrap();
        assert!(output.mode().is_none());
        assert_eq!(output.pipe(), Some(PipeId(0)));
    }
}
