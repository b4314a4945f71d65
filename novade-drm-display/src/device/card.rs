//! A DRM device node driven through the `drm` crate.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use drm::buffer::{Buffer as _, DrmFourcc, DrmModifier, PlanarBuffer};
use drm::control::{
    self, connector, crtc, encoder, framebuffer, plane, Device as ControlDevice, Event, FbCmd2Flags, Mode,
    ModeTypeFlags, PageFlipFlags,
};
use drm::Device as BasicDevice;
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use tracing::{debug, info, trace, warn};

use novade_buffer_manager::{DumbAllocation, GemDevice, GemHandle, MAX_PLANES};

use super::{
    ConnectorId, ConnectorInfo, CrtcId, DeviceOpener, EncoderId, EncoderInfo, FramebufferDesc, FramebufferId,
    ModeInfo, OpenedDevice, PlaneId, PlaneInfo, Rect, ResourceIds,
};
use crate::config::SessionConfig;
use crate::error::InitError;

/// Node families probed during discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeKind {
    Card,
    Render,
}

/// First minor number of render nodes.
const RENDER_NODE_MINOR_BASE: u32 = 128;

struct Node(File);

impl AsFd for Node {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl BasicDevice for Node {}
impl ControlDevice for Node {}

/// Completion events the kernel still owes for flips that timed out, per CRTC.
#[derive(Debug, Default)]
struct LateFlips {
    owed: Mutex<HashMap<u32, u32>>,
}

impl LateFlips {
    fn lock(&self) -> MutexGuard<'_, HashMap<u32, u32>> {
        self.owed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn timed_out(&self, crtc: u32) {
        *self.lock().entry(crtc).or_insert(0) += 1;
    }

    /// Accounts one completion event on `crtc`. Returns `false` when the event
    /// belongs to an earlier flip that already timed out.
    fn complete(&self, crtc: u32) -> bool {
        let mut owed = self.lock();
        match owed.get_mut(&crtc) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                owed.remove(&crtc);
                false
            }
            None => true,
        }
    }
}

/// An open `/dev/dri` node.
pub struct DrmCard {
    node: Node,
    path: PathBuf,
    driver: String,
    flip_timeout: Duration,
    late_flips: LateFlips,
}

impl DrmCard {
    /// Opens `path` and checks that a DRM driver answers on it.
    pub fn open(path: &Path, flip_timeout: Duration) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let node = Node(file);
        let driver = BasicDevice::get_driver(&node)?;
        let driver = driver.name().to_string_lossy().into_owned();
        Ok(Self {
            node,
            path: path.to_path_buf(),
            driver,
            flip_timeout,
            late_flips: LateFlips::default(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn become_master(&self) {
        if let Err(e) = BasicDevice::acquire_master_lock(&self.node) {
            warn!("Could not become DRM master on {:?}, mode-setting may fail: {}", self.path, e);
        }
    }

    fn find_mode(&self, connector: ConnectorId, mode: &ModeInfo) -> io::Result<Mode> {
        let info = ControlDevice::get_connector(&self.node, handle(connector.0)?, false)?;
        info.modes()
            .iter()
            .find(|m| mode_info(m) == *mode)
            .copied()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("mode {} gone from connector", mode.name)))
    }

    /// Drains DRM events until the flip on `crtc` completes or the timeout elapses.
    fn wait_for_flip(&self, crtc: crtc::Handle) -> io::Result<()> {
        let deadline = Instant::now() + self.flip_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.late_flips.timed_out(crtc.into());
                return Err(io::Error::new(io::ErrorKind::TimedOut, "page flip event timed out"));
            }
            let timeout = libc::c_int::try_from(remaining.as_millis()).unwrap_or(libc::c_int::MAX);
            let mut fds = [PollFd::new(&self.node, PollFlags::POLLIN)];
            if !events_ready(poll(&mut fds, timeout))? {
                continue;
            }
            for event in ControlDevice::receive_events(&self.node)? {
                let Event::PageFlip(flip) = event else {
                    continue;
                };
                if flip.crtc != crtc {
                    continue;
                }
                if self.late_flips.complete(crtc.into()) {
                    trace!(frame = flip.frame, "page flip completed");
                    return Ok(());
                }
                debug!(frame = flip.frame, "discarded completion of a timed-out flip");
            }
        }
    }
}

/// Interprets a `poll` result. An empty or interrupted poll is retried by the caller.
fn events_ready(polled: nix::Result<libc::c_int>) -> io::Result<bool> {
    match polled {
        Ok(0) | Err(Errno::EINTR) => Ok(false),
        Ok(_) => Ok(true),
        Err(e) => Err(e.into()),
    }
}

fn handle<T: From<control::RawResourceHandle>>(raw: u32) -> io::Result<T> {
    control::from_u32(raw).ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "zero object id"))
}

fn mode_info(mode: &Mode) -> ModeInfo {
    let (hdisplay, vdisplay) = mode.size();
    ModeInfo {
        name: mode.name().to_string_lossy().into_owned(),
        hdisplay,
        vdisplay,
        vrefresh: mode.vrefresh(),
        preferred: mode.mode_type().contains(ModeTypeFlags::PREFERRED),
    }
}

fn crtc_ids(handles: impl IntoIterator<Item = crtc::Handle>) -> Vec<CrtcId> {
    handles.into_iter().map(|h| CrtcId(h.into())).collect()
}

/// Adapts a [`FramebufferDesc`] to the `drm` crate's framebuffer description.
struct Planar {
    desc: FramebufferDesc,
    format: DrmFourcc,
    handles: [Option<drm::buffer::Handle>; MAX_PLANES],
}

impl PlanarBuffer for Planar {
    fn size(&self) -> (u32, u32) {
        (self.desc.width, self.desc.height)
    }

    fn format(&self) -> DrmFourcc {
        self.format
    }

    fn modifier(&self) -> Option<DrmModifier> {
        None
    }

    fn pitches(&self) -> [u32; 4] {
        self.desc.pitches
    }

    fn handles(&self) -> [Option<drm::buffer::Handle>; 4] {
        self.handles
    }

    fn offsets(&self) -> [u32; 4] {
        self.desc.offsets
    }
}

impl super::KmsDevice for DrmCard {
    fn fd(&self) -> BorrowedFd<'_> {
        self.node.as_fd()
    }

    fn driver_name(&self) -> &str {
        &self.driver
    }

    fn resources(&self) -> io::Result<ResourceIds> {
        let res = ControlDevice::resource_handles(&self.node)?;
        Ok(ResourceIds {
            connectors: res.connectors().iter().map(|h| ConnectorId((*h).into())).collect(),
            encoders: res.encoders().iter().map(|h| EncoderId((*h).into())).collect(),
            crtcs: crtc_ids(res.crtcs().iter().copied()),
        })
    }

    fn connector(&self, id: ConnectorId) -> io::Result<ConnectorInfo> {
        let info = ControlDevice::get_connector(&self.node, handle::<connector::Handle>(id.0)?, true)?;
        Ok(ConnectorInfo {
            id,
            name: format!("{:?}-{}", info.interface(), info.interface_id()),
            connected: info.state() == connector::State::Connected,
            current_encoder: info.current_encoder().map(|h| EncoderId(h.into())),
            encoders: info.encoders().iter().map(|h| EncoderId((*h).into())).collect(),
            modes: info.modes().iter().map(mode_info).collect(),
        })
    }

    fn encoder(&self, id: EncoderId) -> io::Result<EncoderInfo> {
        let info = ControlDevice::get_encoder(&self.node, handle::<encoder::Handle>(id.0)?)?;
        let res = ControlDevice::resource_handles(&self.node)?;
        Ok(EncoderInfo {
            id,
            crtc: info.crtc().map(|h| CrtcId(h.into())),
            possible_crtcs: crtc_ids(res.filter_crtcs(info.possible_crtcs())),
        })
    }

    fn planes(&self) -> io::Result<Vec<PlaneInfo>> {
        let res = ControlDevice::resource_handles(&self.node)?;
        let mut planes = Vec::new();
        for plane in ControlDevice::plane_handles(&self.node)? {
            let info = ControlDevice::get_plane(&self.node, plane)?;
            planes.push(PlaneInfo {
                id: PlaneId(plane.into()),
                possible_crtcs: crtc_ids(res.filter_crtcs(info.possible_crtcs())),
                formats: info.formats().to_vec(),
                crtc: info.crtc().map(|h| CrtcId(h.into())),
            });
        }
        Ok(planes)
    }

    fn add_framebuffer(&self, desc: &FramebufferDesc) -> io::Result<FramebufferId> {
        let format = DrmFourcc::try_from(desc.fourcc)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("unknown fourcc {:#010x}", desc.fourcc)))?;
        let mut handles = [None; MAX_PLANES];
        for (slot, gem) in handles.iter_mut().zip(desc.handles) {
            if let Some(gem) = gem {
                *slot = Some(handle::<drm::buffer::Handle>(gem.0)?);
            }
        }
        let planar = Planar {
            desc: *desc,
            format,
            handles,
        };
        let fb = ControlDevice::add_planar_framebuffer(&self.node, &planar, FbCmd2Flags::empty())?;
        Ok(FramebufferId(fb.into()))
    }

    fn remove_framebuffer(&self, fb: FramebufferId) -> io::Result<()> {
        ControlDevice::destroy_framebuffer(&self.node, handle::<framebuffer::Handle>(fb.0)?)
    }

    fn set_crtc(
        &self,
        crtc: CrtcId,
        fb: FramebufferId,
        origin: (u32, u32),
        connector: ConnectorId,
        mode: &ModeInfo,
    ) -> io::Result<()> {
        let drm_mode = self.find_mode(connector, mode)?;
        ControlDevice::set_crtc(
            &self.node,
            handle::<crtc::Handle>(crtc.0)?,
            Some(handle::<framebuffer::Handle>(fb.0)?),
            origin,
            &[handle::<connector::Handle>(connector.0)?],
            Some(drm_mode),
        )
    }

    fn page_flip(&self, crtc: CrtcId, fb: FramebufferId) -> io::Result<()> {
        let crtc = handle::<crtc::Handle>(crtc.0)?;
        ControlDevice::page_flip(
            &self.node,
            crtc,
            handle::<framebuffer::Handle>(fb.0)?,
            PageFlipFlags::EVENT,
            None,
        )?;
        self.wait_for_flip(crtc)
    }

    fn set_plane(&self, plane: PlaneId, crtc: CrtcId, fb: FramebufferId, src: Rect, dst: Rect) -> io::Result<()> {
        let dst_x = i32::try_from(dst.left).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        let dst_y = i32::try_from(dst.top).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        // Source coordinates are 16.16 fixed point.
        let fixed = |v: u32| v.checked_shl(16).filter(|s| s >> 16 == v);
        let (Some(sx), Some(sy), Some(sw), Some(sh)) =
            (fixed(src.left), fixed(src.top), fixed(src.width), fixed(src.height))
        else {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "source rectangle out of range"));
        };
        ControlDevice::set_plane(
            &self.node,
            handle::<plane::Handle>(plane.0)?,
            handle::<crtc::Handle>(crtc.0)?,
            Some(handle::<framebuffer::Handle>(fb.0)?),
            0,
            (dst_x, dst_y, dst.width, dst.height),
            (sx, sy, sw, sh),
        )
    }
}

impl GemDevice for DrmCard {
    fn import_dma_buf(&self, fd: BorrowedFd<'_>) -> io::Result<GemHandle> {
        let handle = ControlDevice::prime_fd_to_buffer(&self.node, fd)?;
        Ok(GemHandle(handle.into()))
    }

    fn export_dma_buf(&self, gem: GemHandle) -> io::Result<OwnedFd> {
        let flags = (libc::O_CLOEXEC | libc::O_RDWR) as u32;
        ControlDevice::buffer_to_prime_fd(&self.node, handle::<drm::buffer::Handle>(gem.0)?, flags)
    }

    fn create_dumb(&self, width: u32, height: u32, bpp: u32) -> io::Result<DumbAllocation> {
        let format = if bpp == 16 { DrmFourcc::Rgb565 } else { DrmFourcc::Xrgb8888 };
        let dumb = ControlDevice::create_dumb_buffer(&self.node, (width, height), format, bpp)?;
        Ok(DumbAllocation {
            handle: GemHandle(dumb.handle().into()),
            pitch: dumb.pitch(),
            size: u64::from(dumb.pitch()) * u64::from(height),
        })
    }

    fn close_handle(&self, gem: GemHandle) -> io::Result<()> {
        ControlDevice::close_buffer(&self.node, handle::<drm::buffer::Handle>(gem.0)?)
    }
}

/// Opens the configured node, or scans `/dev/dri` for the first usable one.
#[derive(Debug, Default, Clone, Copy)]
pub struct CardOpener;

impl CardOpener {
    fn candidates(config: &SessionConfig) -> Vec<(PathBuf, NodeKind)> {
        if let Some(path) = &config.device_path {
            let kind = if path.to_string_lossy().contains("renderD") {
                NodeKind::Render
            } else {
                NodeKind::Card
            };
            return vec![(path.clone(), kind)];
        }

        let node = |base: &Path, minor: u32| PathBuf::from(format!("{}{}", base.display(), minor));
        let mut candidates = Vec::new();
        if !config.preview {
            candidates.extend(
                (0..config.max_nodes).map(|i| (node(&config.render_node_base, RENDER_NODE_MINOR_BASE + i), NodeKind::Render)),
            );
        }
        candidates.extend((0..config.max_nodes).map(|i| (node(&config.card_node_base, i), NodeKind::Card)));
        candidates
    }
}

impl DeviceOpener for CardOpener {
    fn open(&self, config: &SessionConfig) -> Result<OpenedDevice, InitError> {
        let mut tried = Vec::new();
        for (path, kind) in Self::candidates(config) {
            match DrmCard::open(&path, config.flip_timeout()) {
                Ok(card) => {
                    if kind == NodeKind::Card {
                        card.become_master();
                    }
                    info!("Opened DRM device {:?} (driver {})", card.path(), card.driver);
                    return Ok(OpenedDevice::new(Arc::new(card)));
                }
                Err(e) => {
                    debug!("Skipping DRM node {:?}: {}", path, e);
                    tried.push(path);
                }
            }
        }
        Err(InitError::NoDeviceFound { tried })
    }
}
