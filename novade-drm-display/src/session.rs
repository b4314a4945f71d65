//! The display session: owns the device, the buffer manager, the resolved
//! output and the framebuffer registry, and exposes the presentation
//! lifecycle to the rest of the pipeline.
//!
//! Sessions are built from an explicit [`SessionConfig`] with [`create`], or
//! installed once as the process-wide session with [`install`] and fetched
//! with [`instance`]. A session is not internally synchronized; the global
//! one sits behind a mutex and a single presentation thread is expected.

use std::fmt;
use std::os::fd::BorrowedFd;
use std::sync::{Arc, Mutex, PoisonError};

use novade_buffer_manager::{BufferError, BufferManager, VideoBuffer, MAX_PLANES};
use once_cell::sync::{Lazy, OnceCell};
use tracing::{debug, info, warn};

use crate::bo_buffer::{BoImporter, BufType, CaptureFormat, DmaBuffer, DrmBoBuffer, PlaneDesc};
use crate::config::{DisplayMode, SessionConfig};
use crate::device::{CardOpener, DeviceOpener, FramebufferDesc, KmsDevice, OpenedDevice, Rect};
use crate::error::{DisplayError, InitError, Result};
use crate::fourcc;
use crate::present::{PresentKind, PresentState, Presenter};
use crate::registry::{FbSlot, Framebuffer, FramebufferRegistry};
use crate::topology::{Topology, TopologyRequest, TopologyResolver};

/// Parameters fixed by `render_init`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderTarget {
    pub width: u32,
    pub height: u32,
    /// Capture fourcc of the frames to show.
    pub format: u32,
    pub compose: Rect,
}

/// One display device and everything presented on it.
pub struct DisplaySession {
    config: SessionConfig,
    opener: Arc<dyn DeviceOpener>,
    device: Option<OpenedDevice>,
    buffers: Option<Arc<BufferManager>>,
    display_mode: DisplayMode,
    target: Option<RenderTarget>,
    presenter: Presenter,
    registry: FramebufferRegistry,
    /// The frame currently scanned out, kept alive until the next one replaces it.
    on_screen: Option<Arc<dyn VideoBuffer>>,
    /// The frame `on_screen` replaced while that flip is unconfirmed.
    superseded: Option<Arc<dyn VideoBuffer>>,
}

impl DisplaySession {
    /// Creates a session on the DRM node `config` selects.
    pub fn new(config: SessionConfig) -> Self {
        Self::with_opener(config, Arc::new(CardOpener))
    }

    /// Creates a session whose device comes from `opener`.
    ///
    /// The device is opened right away so producers can allocate buffers
    /// before the first frame; a failure here is logged and retried by
    /// `render_init`.
    pub fn with_opener(config: SessionConfig, opener: Arc<dyn DeviceOpener>) -> Self {
        let mut session = Self {
            display_mode: config.display_mode,
            config,
            opener,
            device: None,
            buffers: None,
            target: None,
            presenter: Presenter::new(),
            registry: FramebufferRegistry::new(),
            on_screen: None,
            superseded: None,
        };
        if let Err(e) = session.ensure_device() {
            warn!("Display device unavailable at session creation: {}", e);
        }
        session
    }

    fn ensure_device(&mut self) -> Result<(Arc<dyn KmsDevice>, Arc<BufferManager>)> {
        if let (Some(device), Some(buffers)) = (&self.device, &self.buffers) {
            return Ok((device.kms.clone(), buffers.clone()));
        }
        let device = self.opener.open(&self.config)?;
        let buffers = BufferManager::new(device.gem.clone());
        let kms = device.kms.clone();
        info!("Display session using driver {}", kms.driver_name());
        self.device = Some(device);
        self.buffers = Some(buffers.clone());
        Ok((kms, buffers))
    }

    /// The configuration the session was created with.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Whether local display output is enabled for this session.
    pub fn can_preview(&self) -> bool {
        self.config.preview
    }

    /// Whether `render_init` has succeeded.
    pub fn is_render_inited(&self) -> bool {
        self.presenter.is_initialized()
    }

    pub fn present_state(&self) -> PresentState {
        self.presenter.state()
    }

    /// The output resolved by `render_init`, if any.
    pub fn topology(&self) -> Option<&Topology> {
        self.presenter.topology()
    }

    /// Frame geometry and compose region fixed by `render_init`.
    pub fn render_target(&self) -> Option<&RenderTarget> {
        self.target.as_ref()
    }

    pub fn display_mode(&self) -> DisplayMode {
        self.display_mode
    }

    /// Selects the presentation path for subsequent `render_buffer` calls.
    pub fn set_display_mode(&mut self, mode: DisplayMode) {
        if mode != self.display_mode {
            debug!("Display mode {:?} -> {:?}", self.display_mode, mode);
        }
        self.display_mode = mode;
    }

    /// Name of the kernel driver behind the open device.
    pub fn module_name(&self) -> Option<&str> {
        self.device.as_ref().map(|d| d.kms.driver_name())
    }

    /// The device descriptor, for collaborators sharing the device context.
    /// Ownership stays with the session.
    pub fn get_drm_handle(&self) -> Option<BorrowedFd<'_>> {
        self.device.as_ref().map(|d| d.kms.fd())
    }

    /// Resolves the output and prepares presentation of `width`x`height`
    /// frames in `format`, showing the `compose` region.
    ///
    /// A connector or CRTC id of 0 means "pick one". Only one successful call
    /// is allowed per session.
    pub fn render_init(
        &mut self,
        connector_id: u32,
        crtc_id: u32,
        width: u32,
        height: u32,
        format: u32,
        compose: Rect,
    ) -> Result<()> {
        if self.is_render_inited() {
            return Err(DisplayError::AlreadyInitialized);
        }
        if !self.config.preview {
            return Err(InitError::PreviewDisabled.into());
        }
        if compose.is_empty() || !compose.fits_within(width, height) {
            return Err(InitError::InvalidCompose {
                rect: compose,
                width,
                height,
            }
            .into());
        }
        let drm_fourcc = fourcc::to_drm_code(format)?;
        let (kms, _) = self.ensure_device()?;

        let request = TopologyRequest::from_raw(
            connector_id,
            crtc_id,
            drm_fourcc,
            self.display_mode == DisplayMode::Overlay,
        );
        let topology = TopologyResolver::new(kms.as_ref(), request).resolve()?;
        self.presenter.initialize(topology, compose)?;
        self.target = Some(RenderTarget {
            width,
            height,
            format,
            compose,
        });
        info!("Display initialized for {}x{} frames, compose {:?}", width, height, compose);
        Ok(())
    }

    /// Whether `buffer` already has a framebuffer.
    pub fn has_framebuffer(&self, buffer: &Arc<dyn VideoBuffer>) -> bool {
        self.registry.contains(buffer)
    }

    /// Makes sure `buffer` has a framebuffer, importing its memory on first sight.
    pub fn render_setup_frame_buffer(&mut self, buffer: &Arc<dyn VideoBuffer>) -> Result<FbSlot> {
        if let Some(slot) = self.registry.lookup(buffer) {
            return Ok(slot);
        }
        let (kms, buffers) = self.ensure_device()?;
        let importer = BoImporter::new(buffers);

        self.registry.insert_if_absent(buffer, || {
            let info = *buffer.info();
            let fourcc = fourcc::to_drm_code(info.format)
                .map_err(|_| DisplayError::Import(BufferError::UnsupportedFormat(info.format)))?;
            let bo = importer.convert(buffer)?.bo().clone();

            let handle = bo.handle();
            let mut handles = [None; MAX_PLANES];
            for slot in handles.iter_mut().take(info.planes) {
                *slot = Some(handle);
            }
            let desc = FramebufferDesc {
                width: info.width,
                height: info.height,
                fourcc,
                handles,
                pitches: info.strides,
                offsets: info.offsets,
            };
            let id = kms.add_framebuffer(&desc).map_err(|source| DisplayError::Framebuffer {
                width: info.width,
                height: info.height,
                fourcc,
                source,
            })?;
            Ok((Framebuffer::new(id, kms.clone()), bo))
        })
    }

    /// Shows `buffer`, creating its framebuffer first if needed.
    ///
    /// A flip whose completion was not confirmed still fails, but `buffer` is
    /// then treated as on screen, together with the frame it replaces, until
    /// a later presentation succeeds.
    pub fn render_buffer(&mut self, buffer: &Arc<dyn VideoBuffer>) -> Result<PresentKind> {
        if !self.is_render_inited() {
            return Err(DisplayError::NotInitialized);
        }
        let slot = self.render_setup_frame_buffer(buffer)?;
        let kms = self.device.as_ref().map(|d| d.kms.clone()).ok_or(DisplayError::NoDevice)?;

        match self.presenter.present(kms.as_ref(), self.display_mode, slot.fb) {
            Ok(kind) => {
                self.on_screen = Some(Arc::clone(buffer));
                self.superseded = None;
                Ok(kind)
            }
            Err(DisplayError::Present(e)) if e.is_flip_queued() => {
                let previous = self.on_screen.replace(Arc::clone(buffer));
                if self.superseded.is_none() {
                    self.superseded = previous;
                }
                Err(e.into())
            }
            Err(e) => Err(e),
        }
    }

    fn is_on_screen(&self, buffer: &Arc<dyn VideoBuffer>) -> bool {
        [&self.on_screen, &self.superseded]
            .into_iter()
            .flatten()
            .any(|current| Arc::ptr_eq(current, buffer))
    }

    /// Destroys the framebuffer of `buffer`. Returns whether one existed.
    ///
    /// # Errors
    ///
    /// `BufferOnScreen` if the display may still be scanning `buffer` out.
    pub fn release_framebuffer(&mut self, buffer: &Arc<dyn VideoBuffer>) -> Result<bool> {
        if self.is_on_screen(buffer) {
            return Err(DisplayError::BufferOnScreen);
        }
        Ok(self.registry.remove(buffer).is_some())
    }

    /// Destroys the framebuffers of every buffer the pipeline has dropped.
    pub fn purge_released_framebuffers(&mut self) -> usize {
        self.registry.purge_released()
    }

    /// Number of framebuffers currently registered.
    pub fn framebuffer_count(&self) -> usize {
        self.registry.len()
    }

    /// The narrow buffer-import capability for buffer pools.
    pub fn buffer_importer(&mut self) -> Result<BoImporter> {
        let (_, buffers) = self.ensure_device()?;
        Ok(BoImporter::new(buffers))
    }

    /// Allocates an exported device buffer for a producer queue; see
    /// [`BoImporter::allocate`].
    pub fn create_drm_buf(
        &mut self,
        format: &CaptureFormat,
        index: u32,
        buf_type: BufType,
        planes: &mut [PlaneDesc],
    ) -> Result<DmaBuffer> {
        self.buffer_importer()?.allocate(format, index, buf_type, planes)
    }

    /// Wraps `buffer` as a display-capable buffer sharing its memory.
    pub fn convert_to_drm_bo_buf(&mut self, buffer: &Arc<dyn VideoBuffer>) -> Result<Arc<DrmBoBuffer>> {
        self.buffer_importer()?.convert(buffer)
    }
}

impl fmt::Debug for DisplaySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisplaySession")
            .field("device", &self.device)
            .field("display_mode", &self.display_mode)
            .field("state", &self.presenter.state())
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

/// A session shared between the pipeline's threads.
pub type SharedSession = Arc<Mutex<DisplaySession>>;

/// Holds at most one session; the first caller constructs it.
pub struct SessionCell {
    cell: OnceCell<SharedSession>,
}

impl SessionCell {
    pub const fn new() -> Self {
        Self { cell: OnceCell::new() }
    }

    /// The session, if it has been constructed.
    pub fn get(&self) -> Option<SharedSession> {
        self.cell.get().cloned()
    }

    /// Returns the session, running `make` if there is none yet. Concurrent
    /// first callers block until the single construction finishes.
    pub fn get_or_create<F>(&self, make: F) -> SharedSession
    where
        F: FnOnce() -> DisplaySession,
    {
        Arc::clone(self.cell.get_or_init(|| Arc::new(Mutex::new(make()))))
    }

    /// Constructs the session with `make`, or fails if one already exists.
    pub fn install<F>(&self, make: F) -> Result<SharedSession>
    where
        F: FnOnce() -> DisplaySession,
    {
        let mut created = false;
        let session = self.get_or_create(|| {
            created = true;
            make()
        });
        if created {
            Ok(session)
        } else {
            Err(DisplayError::SessionExists)
        }
    }
}

impl Default for SessionCell {
    fn default() -> Self {
        Self::new()
    }
}

/// The process-wide session slot and the configuration it will be built from.
struct GlobalSession {
    cell: SessionCell,
    /// Taken when construction starts; `None` afterwards.
    pending: Mutex<Option<SessionConfig>>,
    opener: Arc<dyn DeviceOpener>,
}

impl GlobalSession {
    fn new(opener: Arc<dyn DeviceOpener>) -> Self {
        Self {
            cell: SessionCell::new(),
            pending: Mutex::new(Some(SessionConfig::default())),
            opener,
        }
    }

    fn take_pending(&self) -> Option<SessionConfig> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    fn install(&self, config: SessionConfig) -> Result<SharedSession> {
        config.validate()?;
        self.cell.install(|| {
            self.take_pending();
            DisplaySession::with_opener(config, self.opener.clone())
        })
    }

    fn instance(&self) -> SharedSession {
        self.cell.get_or_create(|| {
            let config = self.take_pending().unwrap_or_default();
            DisplaySession::with_opener(config, self.opener.clone())
        })
    }

    fn set_preview(&self, preview: bool) -> bool {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        match pending.as_mut() {
            Some(config) => {
                config.preview = preview;
                true
            }
            None => {
                warn!("set_preview({}) ignored: the display session already exists", preview);
                false
            }
        }
    }
}

static GLOBAL: Lazy<GlobalSession> = Lazy::new(|| GlobalSession::new(Arc::new(CardOpener)));

/// Builds a standalone session from `config`.
pub fn create(config: SessionConfig) -> Result<DisplaySession> {
    config.validate()?;
    Ok(DisplaySession::new(config))
}

/// Creates the process-wide session from `config`.
///
/// # Errors
///
/// `SessionExists` if the global session was already created, by an earlier
/// `install` or by `instance`.
pub fn install(config: SessionConfig) -> Result<SharedSession> {
    GLOBAL.install(config)
}

/// The process-wide session, created on first use from the pending
/// configuration (see [`set_preview`]).
pub fn instance() -> SharedSession {
    GLOBAL.instance()
}

/// Sets the preview flag the global session will be created with.
///
/// Only effective before construction of the session starts; returns `false`
/// (and changes nothing) afterwards. Prefer [`install`], which has no
/// ordering constraint.
pub fn set_preview(preview: bool) -> bool {
    GLOBAL.set_preview(preview)
}
