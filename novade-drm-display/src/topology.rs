//! Output topology resolution: which connector, encoder, CRTC and plane a
//! session drives, and with which mode.
//!
//! Explicitly requested ids always win. Otherwise the first connected or
//! enabled candidate in kernel enumeration order is taken. The result is
//! resolved once per session; hot-plug changes are not followed.

use tracing::{debug, info, warn};

use crate::device::{ConnectorId, ConnectorInfo, CrtcId, EncoderId, EncoderInfo, KmsDevice, ModeInfo, PlaneId, ResourceIds};
use crate::error::InitError;

/// What the caller asked for at `render_init`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopologyRequest {
    pub connector: Option<ConnectorId>,
    pub crtc: Option<CrtcId>,
    /// Display-engine fourcc the overlay plane must accept.
    pub fourcc: u32,
    /// Fail resolution when no overlay plane fits.
    pub require_plane: bool,
}

impl TopologyRequest {
    /// Builds a request from raw ids, where 0 means "any".
    pub fn from_raw(connector_id: u32, crtc_id: u32, fourcc: u32, require_plane: bool) -> Self {
        Self {
            connector: (connector_id != 0).then_some(ConnectorId(connector_id)),
            crtc: (crtc_id != 0).then_some(CrtcId(crtc_id)),
            fourcc,
            require_plane,
        }
    }
}

/// The resolved output path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub connector: ConnectorId,
    pub connector_name: String,
    pub encoder: Option<EncoderId>,
    pub crtc: CrtcId,
    /// Position of `crtc` in the device's CRTC list.
    pub crtc_index: usize,
    pub plane: Option<PlaneId>,
    pub mode: ModeInfo,
}

/// A connector together with the mode and encoder chosen for it.
#[derive(Debug, Clone)]
pub struct ResolvedConnector {
    pub info: ConnectorInfo,
    pub mode: ModeInfo,
    pub encoder: Option<EncoderInfo>,
}

pub struct TopologyResolver<'a> {
    device: &'a dyn KmsDevice,
    request: TopologyRequest,
}

impl<'a> TopologyResolver<'a> {
    pub fn new(device: &'a dyn KmsDevice, request: TopologyRequest) -> Self {
        Self { device, request }
    }

    pub fn resolve(&self) -> Result<Topology, InitError> {
        let resources = self.device.resources().map_err(InitError::Resources)?;
        let connector = self.get_connector(&resources)?;
        let (crtc, crtc_index) = self.get_crtc(&resources, &connector)?;
        let plane = match self.get_plane(crtc) {
            Ok(plane) => Some(plane),
            Err(e) if !self.request.require_plane => {
                debug!("No overlay plane available, overlay mode will be refused: {}", e);
                None
            }
            Err(e) => return Err(e),
        };

        let topology = Topology {
            connector: connector.info.id,
            connector_name: connector.info.name,
            encoder: connector.encoder.map(|e| e.id),
            crtc,
            crtc_index,
            plane,
            mode: connector.mode,
        };
        info!(
            "Resolved output {} (connector {}) on CRTC {} with mode {}@{}, plane {:?}",
            topology.connector_name, topology.connector, topology.crtc, topology.mode.name, topology.mode.vrefresh, topology.plane
        );
        Ok(topology)
    }

    /// Selects the requested connector, or the first connected one, then its
    /// preferred mode and current encoder.
    pub fn get_connector(&self, resources: &ResourceIds) -> Result<ResolvedConnector, InitError> {
        let info = match self.request.connector {
            Some(id) => {
                if !resources.connectors.contains(&id) {
                    return Err(InitError::NoConnector(Some(id)));
                }
                let info = self.device.connector(id).map_err(|e| {
                    warn!("Failed to query connector {}: {}", id, e);
                    InitError::NoConnector(Some(id))
                })?;
                if !info.connected {
                    warn!("Requested connector {} ({}) is not connected", id, info.name);
                    return Err(InitError::NoConnector(Some(id)));
                }
                info
            }
            None => resources
                .connectors
                .iter()
                .filter_map(|id| match self.device.connector(*id) {
                    Ok(info) => Some(info),
                    Err(e) => {
                        debug!("Skipping connector {}: {}", id, e);
                        None
                    }
                })
                .find(|info| info.connected)
                .ok_or(InitError::NoConnector(None))?,
        };

        let mode = info
            .modes
            .iter()
            .find(|m| m.preferred)
            .or_else(|| info.modes.first())
            .cloned()
            .ok_or(InitError::NoMode(info.id))?;

        let encoder = info
            .current_encoder
            .or_else(|| info.encoders.first().copied())
            .and_then(|id| match self.device.encoder(id) {
                Ok(encoder) => Some(encoder),
                Err(e) => {
                    warn!("Failed to query encoder {}: {}", id, e);
                    None
                }
            });

        Ok(ResolvedConnector { info, mode, encoder })
    }

    /// Selects the requested CRTC, or the one the encoder drives, or the first
    /// one any of the connector's encoders can drive.
    pub fn get_crtc(&self, resources: &ResourceIds, connector: &ResolvedConnector) -> Result<(CrtcId, usize), InitError> {
        let index_of = |crtc: CrtcId| resources.crtcs.iter().position(|c| *c == crtc);

        if let Some(requested) = self.request.crtc {
            let index = index_of(requested).ok_or(InitError::NoCrtc(Some(requested)))?;
            if let Some(encoder) = &connector.encoder {
                if !encoder.possible_crtcs.contains(&requested) {
                    warn!("CRTC {} is not listed as usable by encoder {}", requested, encoder.id);
                }
            }
            return Ok((requested, index));
        }

        if let Some(crtc) = connector.encoder.as_ref().and_then(|e| e.crtc) {
            if let Some(index) = index_of(crtc) {
                return Ok((crtc, index));
            }
        }

        let candidates = connector
            .encoder
            .iter()
            .cloned()
            .chain(connector.info.encoders.iter().filter_map(|id| self.device.encoder(*id).ok()));
        for encoder in candidates {
            if let Some((index, crtc)) = resources
                .crtcs
                .iter()
                .enumerate()
                .find(|(_, c)| encoder.possible_crtcs.contains(*c))
            {
                return Ok((*crtc, index));
            }
        }
        Err(InitError::NoCrtc(None))
    }

    /// Selects the first plane that can be attached to `crtc` and scans out
    /// the requested format.
    pub fn get_plane(&self, crtc: CrtcId) -> Result<PlaneId, InitError> {
        let planes = self.device.planes().map_err(InitError::Resources)?;
        planes
            .iter()
            .find(|p| p.possible_crtcs.contains(&crtc) && p.formats.contains(&self.request.fourcc))
            .map(|p| p.id)
            .ok_or(InitError::NoPlane {
                crtc,
                fourcc: self.request.fourcc,
            })
    }
}
