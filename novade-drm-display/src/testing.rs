//! Recording fake of the kernel boundary, shared by the unit tests.

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::fs::MetadataExt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use novade_buffer_manager::{
    BufferObject, DumbAllocation, GemDevice, GemHandle, PixelFormat, VideoBuffer, VideoBufferInfo,
};

use crate::config::SessionConfig;
use crate::device::{
    ConnectorId, ConnectorInfo, CrtcId, DeviceOpener, EncoderId, EncoderInfo, FramebufferDesc, FramebufferId,
    KmsDevice, ModeInfo, OpenedDevice, PlaneId, PlaneInfo, Rect, ResourceIds,
};
use crate::error::InitError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    AddFramebuffer(FramebufferDesc),
    RemoveFramebuffer(FramebufferId),
    SetCrtc {
        crtc: CrtcId,
        fb: FramebufferId,
        origin: (u32, u32),
        connector: ConnectorId,
        mode: String,
    },
    PageFlip {
        crtc: CrtcId,
        fb: FramebufferId,
    },
    SetPlane {
        plane: PlaneId,
        crtc: CrtcId,
        fb: FramebufferId,
        src: Rect,
        dst: Rect,
    },
}

impl Call {
    pub fn kind(&self) -> &'static str {
        match self {
            Call::AddFramebuffer(_) => "add_framebuffer",
            Call::RemoveFramebuffer(_) => "remove_framebuffer",
            Call::SetCrtc { .. } => "set_crtc",
            Call::PageFlip { .. } => "page_flip",
            Call::SetPlane { .. } => "set_plane",
        }
    }

    fn is_presentation(&self) -> bool {
        matches!(self, Call::SetCrtc { .. } | Call::PageFlip { .. } | Call::SetPlane { .. })
    }
}

pub fn mode(hdisplay: u16, vdisplay: u16, preferred: bool) -> ModeInfo {
    ModeInfo {
        name: format!("{}x{}", hdisplay, vdisplay),
        hdisplay,
        vdisplay,
        vrefresh: 60,
        preferred,
    }
}

pub const NV12: u32 = PixelFormat::Nv12.fourcc();
pub const XR24: u32 = PixelFormat::Xbgr32.fourcc();

/// A display device with configurable topology that records every
/// mode-setting call and counts buffer handles like the kernel.
pub struct FakeDevice {
    file: File,
    pub resources: ResourceIds,
    pub connectors: Vec<ConnectorInfo>,
    pub encoders: Vec<EncoderInfo>,
    pub planes: Vec<PlaneInfo>,
    calls: Mutex<Vec<Call>>,
    live_framebuffers: Mutex<Vec<FramebufferId>>,
    next_id: AtomicU32,
    by_inode: Mutex<HashMap<u64, GemHandle>>,
    closed: Mutex<Vec<GemHandle>>,
    flip_errors: Mutex<Vec<io::Error>>,
    pub fail_set_crtc: AtomicBool,
    pub reject_framebuffers: AtomicBool,
    pub fail_imports: AtomicBool,
}

impl FakeDevice {
    /// One connected HDMI connector (id 1) on encoder 10, CRTCs 2 and 3, an
    /// overlay plane per CRTC. Plane 30 on CRTC 2 takes NV12 and XR24, plane 31
    /// on CRTC 3 only XR24.
    pub fn new() -> Self {
        Self {
            file: tempfile::tempfile().unwrap(),
            resources: ResourceIds {
                connectors: vec![ConnectorId(1)],
                encoders: vec![EncoderId(10)],
                crtcs: vec![CrtcId(2), CrtcId(3)],
            },
            connectors: vec![ConnectorInfo {
                id: ConnectorId(1),
                name: "HDMIA-1".to_string(),
                connected: true,
                current_encoder: Some(EncoderId(10)),
                encoders: vec![EncoderId(10)],
                modes: vec![mode(1280, 720, false), mode(1920, 1080, true)],
            }],
            encoders: vec![EncoderInfo {
                id: EncoderId(10),
                crtc: Some(CrtcId(2)),
                possible_crtcs: vec![CrtcId(2), CrtcId(3)],
            }],
            planes: vec![
                PlaneInfo {
                    id: PlaneId(30),
                    possible_crtcs: vec![CrtcId(2)],
                    formats: vec![NV12, XR24],
                    crtc: None,
                },
                PlaneInfo {
                    id: PlaneId(31),
                    possible_crtcs: vec![CrtcId(3)],
                    formats: vec![XR24],
                    crtc: None,
                },
            ],
            calls: Mutex::new(Vec::new()),
            live_framebuffers: Mutex::new(Vec::new()),
            next_id: AtomicU32::new(100),
            by_inode: Mutex::new(HashMap::new()),
            closed: Mutex::new(Vec::new()),
            flip_errors: Mutex::new(Vec::new()),
            fail_set_crtc: AtomicBool::new(false),
            reject_framebuffers: AtomicBool::new(false),
            fail_imports: AtomicBool::new(false),
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// Kinds of the mode-set, flip and plane calls, in issue order.
    pub fn presentation_kinds(&self) -> Vec<&'static str> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.is_presentation())
            .map(Call::kind)
            .collect()
    }

    pub fn live_framebuffers(&self) -> Vec<FramebufferId> {
        self.live_framebuffers.lock().unwrap().clone()
    }

    pub fn closed_handles(&self) -> Vec<GemHandle> {
        self.closed.lock().unwrap().clone()
    }

    /// The next page flip fails with `error`.
    pub fn fail_next_flip(&self, error: io::Error) {
        self.flip_errors.lock().unwrap().push(error);
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn next(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }
}

fn not_found() -> io::Error {
    io::Error::from(io::ErrorKind::NotFound)
}

impl KmsDevice for FakeDevice {
    fn fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }

    fn driver_name(&self) -> &str {
        "fake"
    }

    fn resources(&self) -> io::Result<ResourceIds> {
        Ok(self.resources.clone())
    }

    fn connector(&self, id: ConnectorId) -> io::Result<ConnectorInfo> {
        self.connectors.iter().find(|c| c.id == id).cloned().ok_or_else(not_found)
    }

    fn encoder(&self, id: EncoderId) -> io::Result<EncoderInfo> {
        self.encoders.iter().find(|e| e.id == id).cloned().ok_or_else(not_found)
    }

    fn planes(&self) -> io::Result<Vec<PlaneInfo>> {
        Ok(self.planes.clone())
    }

    fn add_framebuffer(&self, desc: &FramebufferDesc) -> io::Result<FramebufferId> {
        if self.reject_framebuffers.load(Ordering::SeqCst) {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        self.record(Call::AddFramebuffer(*desc));
        let fb = FramebufferId(self.next());
        self.live_framebuffers.lock().unwrap().push(fb);
        Ok(fb)
    }

    fn remove_framebuffer(&self, fb: FramebufferId) -> io::Result<()> {
        self.record(Call::RemoveFramebuffer(fb));
        self.live_framebuffers.lock().unwrap().retain(|f| *f != fb);
        Ok(())
    }

    fn set_crtc(
        &self,
        crtc: CrtcId,
        fb: FramebufferId,
        origin: (u32, u32),
        connector: ConnectorId,
        mode: &ModeInfo,
    ) -> io::Result<()> {
        self.record(Call::SetCrtc {
            crtc,
            fb,
            origin,
            connector,
            mode: mode.name.clone(),
        });
        if self.fail_set_crtc.load(Ordering::SeqCst) {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        Ok(())
    }

    fn page_flip(&self, crtc: CrtcId, fb: FramebufferId) -> io::Result<()> {
        self.record(Call::PageFlip { crtc, fb });
        match self.flip_errors.lock().unwrap().pop() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn set_plane(&self, plane: PlaneId, crtc: CrtcId, fb: FramebufferId, src: Rect, dst: Rect) -> io::Result<()> {
        self.record(Call::SetPlane {
            plane,
            crtc,
            fb,
            src,
            dst,
        });
        Ok(())
    }
}

impl GemDevice for FakeDevice {
    fn import_dma_buf(&self, fd: BorrowedFd<'_>) -> io::Result<GemHandle> {
        if self.fail_imports.load(Ordering::SeqCst) {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        let inode = File::from(fd.try_clone_to_owned()?).metadata()?.ino();
        let mut by_inode = self.by_inode.lock().unwrap();
        if let Some(handle) = by_inode.get(&inode) {
            return Ok(*handle);
        }
        let handle = GemHandle(self.next());
        by_inode.insert(inode, handle);
        Ok(handle)
    }

    fn export_dma_buf(&self, _handle: GemHandle) -> io::Result<OwnedFd> {
        Ok(tempfile::tempfile()?.into())
    }

    fn create_dumb(&self, width: u32, height: u32, bpp: u32) -> io::Result<DumbAllocation> {
        if width == 0 || height == 0 {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        let pitch = width * bpp / 8;
        Ok(DumbAllocation {
            handle: GemHandle(self.next()),
            pitch,
            size: u64::from(pitch) * u64::from(height),
        })
    }

    fn close_handle(&self, handle: GemHandle) -> io::Result<()> {
        self.by_inode.lock().unwrap().retain(|_, h| *h != handle);
        self.closed.lock().unwrap().push(handle);
        Ok(())
    }
}

/// Hands out one shared [`FakeDevice`] and counts how often it was asked to.
pub struct FakeOpener {
    pub device: Arc<FakeDevice>,
    pub opens: AtomicUsize,
    /// Number of upcoming `open` calls that fail.
    pub failures: AtomicUsize,
}

impl FakeOpener {
    pub fn new(device: FakeDevice) -> Arc<Self> {
        Arc::new(Self {
            device: Arc::new(device),
            opens: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
        })
    }
}

impl DeviceOpener for FakeOpener {
    fn open(&self, _config: &SessionConfig) -> Result<OpenedDevice, InitError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(InitError::NoDeviceFound { tried: Vec::new() });
        }
        Ok(OpenedDevice::new(self.device.clone()))
    }
}

/// A pipeline frame backed by a temporary file standing in for a dma-buf.
#[derive(Debug)]
pub struct TestFrame {
    info: VideoBufferInfo,
    file: Option<File>,
    bo: Option<Arc<BufferObject>>,
    timestamp: Option<Duration>,
}

impl TestFrame {
    pub fn new(format: u32, width: u32, height: u32) -> Self {
        let info = VideoBufferInfo::new(format, width, height).unwrap();
        let file = tempfile::tempfile().unwrap();
        file.set_len(info.size).unwrap();
        Self {
            info,
            file: Some(file),
            bo: None,
            timestamp: Some(Duration::from_millis(33)),
        }
    }

    /// A frame with CPU-only memory and no exportable descriptor.
    pub fn without_fd(format: u32, width: u32, height: u32) -> Self {
        Self {
            file: None,
            ..Self::new(format, width, height)
        }
    }

    /// A frame whose memory already lives in `bo`.
    pub fn with_buffer_object(format: u32, width: u32, height: u32, bo: Arc<BufferObject>) -> Self {
        Self {
            file: None,
            bo: Some(bo),
            ..Self::new(format, width, height)
        }
    }

    pub fn shared(self) -> Arc<dyn VideoBuffer> {
        Arc::new(self)
    }
}

impl VideoBuffer for TestFrame {
    fn info(&self) -> &VideoBufferInfo {
        &self.info
    }

    fn dma_fd(&self) -> Option<BorrowedFd<'_>> {
        self.file.as_ref().map(|f| f.as_fd())
    }

    fn buffer_object(&self) -> Option<&Arc<BufferObject>> {
        self.bo.as_ref()
    }

    fn timestamp(&self) -> Option<Duration> {
        self.timestamp
    }
}
