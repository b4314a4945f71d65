//! Mode-set and presentation state machine.

use std::io;

use tracing::{debug, info, warn};

use crate::config::DisplayMode;
use crate::device::{FramebufferId, KmsDevice, Rect};
use crate::error::{DisplayError, PresentError};
use crate::topology::Topology;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentState {
    /// No topology resolved yet.
    Uninitialized,
    /// Topology resolved, no mode established on the CRTC.
    Initialized,
    /// Steady state: frames go out through flips or plane updates.
    Presenting,
}

/// The hardware operation a frame was presented with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentKind {
    ModeSet,
    PageFlip,
    PlaneUpdate,
}

#[derive(Debug)]
struct Output {
    topology: Topology,
    compose: Rect,
}

/// Drives one CRTC through mode-set, flips and plane updates.
#[derive(Debug)]
pub struct Presenter {
    state: PresentState,
    output: Option<Output>,
    /// Whether the CRTC currently scans out one of our framebuffers.
    crtc_bound: bool,
}

impl Default for Presenter {
    fn default() -> Self {
        Self::new()
    }
}

/// Flips that only collided with a pending one.
fn is_busy(error: &io::Error) -> bool {
    error.raw_os_error() == Some(libc::EBUSY)
}

impl Presenter {
    pub fn new() -> Self {
        Self {
            state: PresentState::Uninitialized,
            output: None,
            crtc_bound: false,
        }
    }

    pub fn state(&self) -> PresentState {
        self.state
    }

    /// Whether a topology has been taken over.
    pub fn is_initialized(&self) -> bool {
        self.state != PresentState::Uninitialized
    }

    /// The output frames are presented on.
    pub fn topology(&self) -> Option<&Topology> {
        self.output.as_ref().map(|o| &o.topology)
    }

    /// Region of each frame that is shown.
    pub fn compose(&self) -> Option<Rect> {
        self.output.as_ref().map(|o| o.compose)
    }

    /// Takes over a resolved topology. Only valid once per presenter.
    pub fn initialize(&mut self, topology: Topology, compose: Rect) -> Result<(), DisplayError> {
        if self.is_initialized() {
            return Err(DisplayError::AlreadyInitialized);
        }
        self.output = Some(Output { topology, compose });
        self.state = PresentState::Initialized;
        Ok(())
    }

    /// Puts `fb` on screen through the path `mode` selects.
    pub fn present(&mut self, device: &dyn KmsDevice, mode: DisplayMode, fb: FramebufferId) -> Result<PresentKind, DisplayError> {
        let Some(output) = &self.output else {
            return Err(DisplayError::NotInitialized);
        };
        if output.compose.is_empty() {
            return Err(PresentError::InvalidGeometry(output.compose).into());
        }

        match mode {
            DisplayMode::Overlay => self.set_plane(device, fb),
            DisplayMode::Primary | DisplayMode::None if self.crtc_bound => self.page_flip(device, fb),
            DisplayMode::Primary | DisplayMode::None => self.set_crtc(device, fb),
        }
    }

    fn output(&self) -> Result<&Output, DisplayError> {
        self.output.as_ref().ok_or(DisplayError::NotInitialized)
    }

    fn set_crtc(&mut self, device: &dyn KmsDevice, fb: FramebufferId) -> Result<PresentKind, DisplayError> {
        let output = self.output()?;
        let topology = &output.topology;
        let origin = (output.compose.left, output.compose.top);
        if let Err(e) = device.set_crtc(topology.crtc, fb, origin, topology.connector, &topology.mode) {
            self.crtc_bound = false;
            self.state = PresentState::Initialized;
            return Err(PresentError::Modeset(e).into());
        }
        info!(
            "Mode {} set on CRTC {} for {} with framebuffer {}",
            topology.mode.name, topology.crtc, topology.connector_name, fb
        );
        self.crtc_bound = true;
        self.state = PresentState::Presenting;
        Ok(PresentKind::ModeSet)
    }

    fn page_flip(&mut self, device: &dyn KmsDevice, fb: FramebufferId) -> Result<PresentKind, DisplayError> {
        let crtc = self.output()?.topology.crtc;
        match device.page_flip(crtc, fb) {
            Ok(()) => {
                debug!(fb = fb.0, "page flip done");
                Ok(PresentKind::PageFlip)
            }
            Err(e) if is_busy(&e) => {
                warn!("Page flip on CRTC {} busy, dropping frame: {}", crtc, e);
                Err(PresentError::Flip { busy: true, source: e }.into())
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                warn!("Page flip on CRTC {} queued but not confirmed: {}", crtc, e);
                Err(PresentError::FlipUnconfirmed(e).into())
            }
            Err(e) => {
                warn!("Page flip on CRTC {} failed, next frame re-sets the mode: {}", crtc, e);
                self.crtc_bound = false;
                self.state = PresentState::Initialized;
                Err(PresentError::Flip { busy: false, source: e }.into())
            }
        }
    }

    fn set_plane(&mut self, device: &dyn KmsDevice, fb: FramebufferId) -> Result<PresentKind, DisplayError> {
        let output = self.output()?;
        let topology = &output.topology;
        let plane = topology.plane.ok_or(PresentError::NoPlane)?;
        let dst = Rect::new(0, 0, u32::from(topology.mode.hdisplay), u32::from(topology.mode.vdisplay));
        if dst.is_empty() {
            return Err(PresentError::InvalidGeometry(dst).into());
        }
        device
            .set_plane(plane, topology.crtc, fb, output.compose, dst)
            .map_err(PresentError::Plane)?;
        debug!(fb = fb.0, plane = plane.0, "plane updated");
        self.state = PresentState::Presenting;
        Ok(PresentKind::PlaneUpdate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{ConnectorId, CrtcId, PlaneId};
    use crate::testing::{mode, Call, FakeDevice};
    use pretty_assertions::assert_eq;

    fn topology(plane: Option<PlaneId>) -> Topology {
        Topology {
            connector: ConnectorId(1),
            connector_name: "HDMIA-1".to_string(),
            encoder: None,
            crtc: CrtcId(2),
            crtc_index: 0,
            plane,
            mode: mode(1920, 1080, true),
        }
    }

    fn presenter(plane: Option<PlaneId>, compose: Rect) -> Presenter {
        let mut presenter = Presenter::new();
        presenter.initialize(topology(plane), compose).unwrap();
        presenter
    }

    const FULL: Rect = Rect::new(0, 0, 1920, 1080);

    #[test]
    fn test_uninitialized_presents_nothing() {
        let device = FakeDevice::new();
        let mut presenter = Presenter::new();
        let err = presenter.present(&device, DisplayMode::Primary, FramebufferId(1)).unwrap_err();
        assert!(matches!(err, DisplayError::NotInitialized));
        assert!(device.calls().is_empty());
    }

    #[test]
    fn test_primary_sets_crtc_then_flips() {
        let device = FakeDevice::new();
        let mut presenter = presenter(None, FULL);
        assert_eq!(presenter.state(), PresentState::Initialized);

        let kinds: Vec<_> = (1..=3)
            .map(|fb| presenter.present(&device, DisplayMode::Primary, FramebufferId(fb)).unwrap())
            .collect();
        assert_eq!(kinds, vec![PresentKind::ModeSet, PresentKind::PageFlip, PresentKind::PageFlip]);
        assert_eq!(device.presentation_kinds(), vec!["set_crtc", "page_flip", "page_flip"]);
        assert_eq!(presenter.state(), PresentState::Presenting);
    }

    #[test]
    fn test_mode_set_uses_compose_origin() {
        let device = FakeDevice::new();
        let mut presenter = presenter(None, Rect::new(16, 8, 640, 480));
        presenter.present(&device, DisplayMode::None, FramebufferId(7)).unwrap();
        assert_eq!(
            device.calls(),
            vec![Call::SetCrtc {
                crtc: CrtcId(2),
                fb: FramebufferId(7),
                origin: (16, 8),
                connector: ConnectorId(1),
                mode: "1920x1080".to_string(),
            }]
        );
    }

    #[test]
    fn test_failed_mode_set_is_retried() {
        let device = FakeDevice::new();
        let mut presenter = presenter(None, FULL);
        device.fail_set_crtc.store(true, std::sync::atomic::Ordering::SeqCst);
        let err = presenter.present(&device, DisplayMode::Primary, FramebufferId(1)).unwrap_err();
        assert!(matches!(err, DisplayError::Present(PresentError::Modeset(_))));
        assert_eq!(presenter.state(), PresentState::Initialized);

        device.fail_set_crtc.store(false, std::sync::atomic::Ordering::SeqCst);
        let kind = presenter.present(&device, DisplayMode::Primary, FramebufferId(1)).unwrap();
        assert_eq!(kind, PresentKind::ModeSet);
        assert_eq!(device.presentation_kinds(), vec!["set_crtc", "set_crtc"]);
    }

    #[test]
    fn test_busy_flip_keeps_presenting() {
        let device = FakeDevice::new();
        let mut presenter = presenter(None, FULL);
        presenter.present(&device, DisplayMode::Primary, FramebufferId(1)).unwrap();

        device.fail_next_flip(io::Error::from_raw_os_error(libc::EBUSY));
        let err = presenter.present(&device, DisplayMode::Primary, FramebufferId(2)).unwrap_err();
        assert!(matches!(&err, DisplayError::Present(p) if p.is_busy()));
        assert_eq!(presenter.state(), PresentState::Presenting);

        presenter.present(&device, DisplayMode::Primary, FramebufferId(3)).unwrap();
        assert_eq!(device.presentation_kinds(), vec!["set_crtc", "page_flip", "page_flip"]);
    }

    #[test]
    fn test_flip_timeout_counts_as_busy() {
        let device = FakeDevice::new();
        let mut presenter = presenter(None, FULL);
        presenter.present(&device, DisplayMode::Primary, FramebufferId(1)).unwrap();
        device.fail_next_flip(io::Error::from(io::ErrorKind::TimedOut));
        let err = presenter.present(&device, DisplayMode::Primary, FramebufferId(2)).unwrap_err();
        assert!(matches!(&err, DisplayError::Present(p) if p.is_busy() && p.is_flip_queued()));
        assert_eq!(presenter.state(), PresentState::Presenting);

        presenter.present(&device, DisplayMode::Primary, FramebufferId(3)).unwrap();
        assert_eq!(device.presentation_kinds(), vec!["set_crtc", "page_flip", "page_flip"]);
    }

    #[test]
    fn test_fatal_flip_falls_back_to_mode_set() {
        let device = FakeDevice::new();
        let mut presenter = presenter(None, FULL);
        presenter.present(&device, DisplayMode::Primary, FramebufferId(1)).unwrap();

        device.fail_next_flip(io::Error::from_raw_os_error(libc::EINVAL));
        let err = presenter.present(&device, DisplayMode::Primary, FramebufferId(2)).unwrap_err();
        assert!(matches!(err, DisplayError::Present(PresentError::Flip { busy: false, .. })));
        assert_eq!(presenter.state(), PresentState::Initialized);

        presenter.present(&device, DisplayMode::Primary, FramebufferId(3)).unwrap();
        assert_eq!(device.presentation_kinds(), vec!["set_crtc", "page_flip", "set_crtc"]);
    }

    #[test]
    fn test_overlay_only_updates_plane() {
        let device = FakeDevice::new();
        let compose = Rect::new(0, 0, 1280, 720);
        let mut presenter = presenter(Some(PlaneId(30)), compose);
        for fb in 1..=3 {
            let kind = presenter.present(&device, DisplayMode::Overlay, FramebufferId(fb)).unwrap();
            assert_eq!(kind, PresentKind::PlaneUpdate);
        }
        assert_eq!(device.presentation_kinds(), vec!["set_plane"; 3]);
        assert_eq!(
            device.calls()[0],
            Call::SetPlane {
                plane: PlaneId(30),
                crtc: CrtcId(2),
                fb: FramebufferId(1),
                src: compose,
                dst: FULL,
            }
        );
    }

    #[test]
    fn test_overlay_without_plane_fails() {
        let device = FakeDevice::new();
        let mut presenter = presenter(None, FULL);
        let err = presenter.present(&device, DisplayMode::Overlay, FramebufferId(1)).unwrap_err();
        assert!(matches!(err, DisplayError::Present(PresentError::NoPlane)));
        assert!(device.calls().is_empty());
    }

    #[test]
    fn test_zero_area_compose_rejected_before_hardware() {
        let device = FakeDevice::new();
        let mut presenter = presenter(Some(PlaneId(30)), Rect::new(0, 0, 0, 1080));
        let err = presenter.present(&device, DisplayMode::Overlay, FramebufferId(1)).unwrap_err();
        assert!(matches!(err, DisplayError::Present(PresentError::InvalidGeometry(_))));
        assert!(device.calls().is_empty());
    }

    #[test]
    fn test_second_initialize_refused() {
        let mut presenter = presenter(None, FULL);
        let err = presenter.initialize(topology(None), FULL).unwrap_err();
        assert!(matches!(err, DisplayError::AlreadyInitialized));
    }
}
