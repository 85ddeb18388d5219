//! Transfer-queue upload engine.
//!
//! Requests are processed in submission order. Each `update()` polls every slot
//! still in flight, then fills one staging epoch on a free slot, records copies
//! plus release barriers on the transfer queue and submits them with the slot
//! fence. A destination only becomes visible to
//! [`AsyncLoader::signal_textures`] / [`AsyncLoader::signal_buffers`] after that
//! fence has been observed signaled; those calls record the matching acquire
//! barriers into the main command buffer.

use ash::vk;
use crossbeam_channel::{Receiver, Sender};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use super::device::Device;
use super::resource_pool::Handle;
use super::resources::{Buffer, BufferCI, Texture};
use crate::vulkan::barrier::{self, QueueTransfer};
use crate::vulkan::{submit_with_fence, CommandRing, QueueKind};
use crate::{AshError, Result};

const STAGING_ALIGNMENT: u64 = 16;

/// Every stage that may read an uploaded buffer on the main queue.
const BUFFER_CONSUMER_STAGES: vk::PipelineStageFlags2 = vk::PipelineStageFlags2::from_raw(
    vk::PipelineStageFlags2::DRAW_INDIRECT.as_raw()
        | vk::PipelineStageFlags2::VERTEX_INPUT.as_raw()
        | vk::PipelineStageFlags2::VERTEX_SHADER.as_raw()
        | vk::PipelineStageFlags2::FRAGMENT_SHADER.as_raw()
        | vk::PipelineStageFlags2::COMPUTE_SHADER.as_raw()
        | vk::PipelineStageFlags2::ALL_TRANSFER.as_raw(),
);
const BUFFER_CONSUMER_ACCESS: vk::AccessFlags2 = vk::AccessFlags2::from_raw(
    vk::AccessFlags2::INDIRECT_COMMAND_READ.as_raw()
        | vk::AccessFlags2::INDEX_READ.as_raw()
        | vk::AccessFlags2::VERTEX_ATTRIBUTE_READ.as_raw()
        | vk::AccessFlags2::UNIFORM_READ.as_raw()
        | vk::AccessFlags2::SHADER_STORAGE_READ.as_raw()
        | vk::AccessFlags2::TRANSFER_READ.as_raw(),
);

/// One pending transfer. Destinations are handles, resolved when the copy is recorded.
#[derive(Debug)]
pub enum UploadRequest {
    /// Host bytes into a buffer at `offset`.
    Buffer {
        dst: Handle<Buffer>,
        offset: u64,
        data: Vec<u8>,
    },
    /// Tightly packed mip-0 texels for every layer of a texture.
    Texture { dst: Handle<Texture>, data: Vec<u8> },
    /// Buffer-to-buffer copy; `src` must be host written and unused by other queues.
    Copy {
        src: Handle<Buffer>,
        dst: Handle<Buffer>,
        size: u64,
    },
}

impl UploadRequest {
    pub fn staging_size(&self) -> u64 {
        match self {
            UploadRequest::Buffer { data, .. } | UploadRequest::Texture { data, .. } => {
                data.len() as u64
            }
            UploadRequest::Copy { .. } => 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileTarget {
    /// Decoded to RGBA8 and uploaded as mip 0.
    Texture(Handle<Texture>),
    /// Raw file bytes.
    Buffer(Handle<Buffer>),
}

#[derive(Clone, Debug)]
pub struct FileRequest {
    pub path: PathBuf,
    pub target: FileTarget,
}

/// A destination whose transfer has been submitted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Uploaded {
    Buffer(Handle<Buffer>),
    Texture(Handle<Texture>),
}

/// Per-slot bookkeeping of submitted uploads.
#[derive(Debug)]
pub struct UploadTracker {
    slots: Vec<Option<Vec<Uploaded>>>,
    next: usize,
}

impl UploadTracker {
    pub fn new(slots: usize) -> Self {
        Self {
            slots: (0..slots).map(|_| None).collect(),
            next: 0,
        }
    }

    pub fn is_busy(&self, slot: usize) -> bool {
        self.slots[slot].is_some()
    }

    /// First idle slot, starting after the most recent submission.
    pub fn next_free(&self) -> Option<usize> {
        let count = self.slots.len();
        (0..count)
            .map(|step| (self.next + step) % count)
            .find(|slot| !self.is_busy(*slot))
    }

    pub fn submit(&mut self, slot: usize, uploaded: Vec<Uploaded>) {
        debug_assert!(!self.is_busy(slot), "slot {slot} resubmitted while in flight");
        self.slots[slot] = Some(uploaded);
        self.next = (slot + 1) % self.slots.len();
    }

    /// Polls every busy slot and frees those whose fence is signaled, returning
    /// their destinations. Idle slots are never polled.
    pub fn retire_completed(
        &mut self,
        mut fence_signaled: impl FnMut(usize) -> Result<bool>,
    ) -> Result<Vec<Uploaded>> {
        let mut done = Vec::new();
        for slot in 0..self.slots.len() {
            if self.is_busy(slot) && fence_signaled(slot)? {
                done.extend(self.slots[slot].take().unwrap_or_default());
            }
        }
        Ok(done)
    }

    /// Forgets every submission. Only valid once the transfer queue is idle.
    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
    }

    pub fn in_flight(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }
}

/// Bump allocator over one staging epoch.
#[derive(Debug)]
pub struct StagingAllocator {
    capacity: u64,
    offset: AtomicU64,
}

impl StagingAllocator {
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            offset: AtomicU64::new(0),
        }
    }

    /// Reserves `size` bytes. `Ok(None)` means the epoch is full and the request
    /// should wait for the next one; a request that can never fit is an error.
    pub fn allocate(&self, size: u64) -> Result<Option<u64>> {
        if size > self.capacity {
            return Err(AshError::StagingOverflow {
                requested: size,
                capacity: self.capacity,
            });
        }
        let aligned = size.next_multiple_of(STAGING_ALIGNMENT);
        let capacity = self.capacity;
        Ok(self
            .offset
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |offset| {
                (offset + size <= capacity).then_some(offset + aligned)
            })
            .ok())
    }

    pub fn used(&self) -> u64 {
        self.offset.load(Ordering::Acquire).min(self.capacity)
    }

    pub fn reset(&self) {
        self.offset.store(0, Ordering::Release);
    }
}

/// Pops requests in FIFO order while they fit the current staging epoch.
fn plan_epoch(
    queue: &mut VecDeque<UploadRequest>,
    staging: &StagingAllocator,
) -> Vec<(UploadRequest, u64)> {
    let mut batch = Vec::new();
    while let Some(request) = queue.pop_front() {
        match staging.allocate(request.staging_size()) {
            Ok(Some(offset)) => batch.push((request, offset)),
            Ok(None) => {
                queue.push_front(request);
                break;
            }
            Err(e) => error!("Dropping upload request: {e}"),
        }
    }
    batch
}

/// Puts an unsubmitted batch back at the head of the queue in its original order.
fn requeue(queue: &mut VecDeque<UploadRequest>, batch: Vec<(UploadRequest, u64)>) {
    for (request, _) in batch.into_iter().rev() {
        queue.push_front(request);
    }
}

fn decode(request: &FileRequest) -> Result<UploadRequest> {
    match request.target {
        FileTarget::Texture(dst) => {
            let image = image::open(&request.path).map_err(|e| {
                AshError::AssetError(format!("Failed to decode {}: {e}", request.path.display()))
            })?;
            Ok(UploadRequest::Texture {
                dst,
                data: image.to_rgba8().into_raw(),
            })
        }
        FileTarget::Buffer(dst) => Ok(UploadRequest::Buffer {
            dst,
            offset: 0,
            data: std::fs::read(&request.path)?,
        }),
    }
}

/// Background thread turning file requests into upload requests.
struct DecodeWorker {
    requests: Option<Sender<FileRequest>>,
    results: Receiver<(PathBuf, Result<UploadRequest>)>,
    thread: Option<JoinHandle<()>>,
}

impl DecodeWorker {
    fn spawn() -> Result<Self> {
        let (request_tx, request_rx) = crossbeam_channel::unbounded::<FileRequest>();
        let (result_tx, result_rx) = crossbeam_channel::unbounded();
        let thread = std::thread::Builder::new()
            .name("asset-decode".into())
            .spawn(move || {
                for request in request_rx {
                    let outcome = decode(&request);
                    if result_tx.send((request.path, outcome)).is_err() {
                        break;
                    }
                }
            })?;
        Ok(Self {
            requests: Some(request_tx),
            results: result_rx,
            thread: Some(thread),
        })
    }

    fn send(&self, request: FileRequest) -> Result<()> {
        self.requests
            .as_ref()
            .ok_or_else(|| AshError::AssetError("Decode worker has stopped".into()))?
            .send(request)
            .map_err(|_| AshError::AssetError("Decode worker has stopped".into()))
    }

    fn stop(&mut self) {
        self.requests.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("Decode worker panicked");
            }
        }
    }
}

impl Drop for DecodeWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

struct TransferSlot {
    fence: vk::Fence,
    staging: Handle<Buffer>,
}

fn bytes_per_texel(format: vk::Format) -> Option<u64> {
    match format {
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB => Some(4),
        vk::Format::R16G16B16A16_SFLOAT => Some(8),
        vk::Format::R32G32B32A32_SFLOAT => Some(16),
        _ => None,
    }
}

pub struct AsyncLoader {
    device: Arc<ash::Device>,
    transfer: QueueTransfer,
    transfer_queue: vk::Queue,
    commands: CommandRing,
    slots: Vec<TransferSlot>,
    staging: StagingAllocator,
    tracker: UploadTracker,
    uploads: VecDeque<UploadRequest>,
    decoder: DecodeWorker,
    pending_textures: Mutex<Vec<Handle<Texture>>>,
    pending_buffers: Mutex<Vec<Handle<Buffer>>>,
}

impl AsyncLoader {
    pub fn new(device: &mut Device) -> Result<Self> {
        let raw = Arc::clone(device.raw());
        let slot_count = device.frames_in_flight();
        let capacity = device.config().staging_buffer_size;
        let transfer = QueueTransfer::new(
            device.queue_family(QueueKind::Transfer),
            device.queue_family(QueueKind::Main),
        );

        let commands = CommandRing::new(Arc::clone(&raw), transfer.src_family, slot_count)?;
        let mut slots = Vec::with_capacity(slot_count);
        for index in 0..slot_count {
            let staging = device.create_buffer(
                &BufferCI::new(capacity, vk::BufferUsageFlags::TRANSFER_SRC)
                    .mapped()
                    .name(format!("upload_staging[{index}]")),
            )?;
            let fence = unsafe { raw.create_fence(&vk::FenceCreateInfo::default(), None) }?;
            slots.push(TransferSlot { fence, staging });
        }

        info!(
            "Async loader ready: {slot_count} slots x {capacity} bytes staging, {}",
            if transfer.crosses_families() {
                "dedicated transfer family"
            } else {
                "transfer shares the main family"
            }
        );

        Ok(Self {
            device: raw,
            transfer,
            transfer_queue: device.queue(QueueKind::Transfer),
            commands,
            slots,
            staging: StagingAllocator::new(capacity),
            tracker: UploadTracker::new(slot_count),
            uploads: VecDeque::new(),
            decoder: DecodeWorker::spawn()?,
            pending_textures: Mutex::new(Vec::new()),
            pending_buffers: Mutex::new(Vec::new()),
        })
    }

    pub fn enqueue(&mut self, request: UploadRequest) {
        self.uploads.push_back(request);
    }

    /// Hands a file to the decode worker; the result is queued as an upload by a later `update()`.
    pub fn request_file(&self, request: FileRequest) -> Result<()> {
        self.decoder.send(request)
    }

    pub fn pending_uploads(&self) -> usize {
        self.uploads.len()
    }

    pub fn in_flight(&self) -> usize {
        self.tracker.in_flight()
    }

    /// Called once per frame; never blocks.
    ///
    /// A batch whose recording or submission fails goes back to the head of the
    /// queue and the error is returned; the next call retries it.
    pub fn update(&mut self, device: &mut Device) -> Result<()> {
        self.uploads.extend(device.take_initial_uploads());
        self.collect_decoded();

        let raw = &self.device;
        let slots = &self.slots;
        let done = self
            .tracker
            .retire_completed(|slot| Ok(unsafe { raw.get_fence_status(slots[slot].fence) }?))?;
        self.publish(done);

        if self.uploads.is_empty() {
            return Ok(());
        }
        // Every slot still in flight; retry next frame.
        let Some(slot) = self.tracker.next_free() else {
            return Ok(());
        };
        let batch = plan_epoch(&mut self.uploads, &self.staging);
        if batch.is_empty() {
            return Ok(());
        }

        match self.submit_batch(device, slot, &batch) {
            Ok(uploaded) => {
                debug!(
                    "Submitted {} uploads ({} staging bytes) on slot {slot}",
                    uploaded.len(),
                    self.staging.used()
                );
                self.tracker.submit(slot, uploaded);
                self.staging.reset();
                Ok(())
            }
            Err(e) => {
                self.staging.reset();
                warn!("Transfer batch of {} uploads requeued: {e}", batch.len());
                requeue(&mut self.uploads, batch);
                Err(e)
            }
        }
    }

    fn submit_batch(
        &self,
        device: &Device,
        slot: usize,
        batch: &[(UploadRequest, u64)],
    ) -> Result<Vec<Uploaded>> {
        let cmd = self.commands.begin(slot)?;
        let staging = self.slots[slot].staging;
        let mut uploaded = Vec::with_capacity(batch.len());
        for (request, offset) in batch {
            match self.record(device, cmd, staging, request, *offset) {
                Ok(Some(done)) => uploaded.push(done),
                Ok(None) => {}
                Err(e) => warn!("Skipping upload: {e}"),
            }
        }
        self.commands.end(cmd)?;

        let cmd_infos = [vk::CommandBufferSubmitInfo::default().command_buffer(cmd)];
        let submit = vk::SubmitInfo2::default().command_buffer_infos(&cmd_infos);
        submit_with_fence(
            &self.device,
            self.transfer_queue,
            &[submit],
            self.slots[slot].fence,
        )?;
        Ok(uploaded)
    }

    fn collect_decoded(&mut self) {
        while let Ok((path, outcome)) = self.decoder.results.try_recv() {
            match outcome {
                Ok(request) => {
                    debug!("Decoded {}", path.display());
                    self.uploads.push_back(request);
                }
                Err(e) => error!("{e}"),
            }
        }
    }

    fn publish(&self, done: Vec<Uploaded>) {
        if done.is_empty() {
            return;
        }
        let mut textures = self.pending_textures.lock();
        let mut buffers = self.pending_buffers.lock();
        for resource in done {
            match resource {
                Uploaded::Texture(handle) => textures.push(handle),
                Uploaded::Buffer(handle) => buffers.push(handle),
            }
        }
    }

    fn record(
        &self,
        device: &Device,
        cmd: vk::CommandBuffer,
        staging: Handle<Buffer>,
        request: &UploadRequest,
        offset: u64,
    ) -> Result<Option<Uploaded>> {
        let staging_raw = device.buffer(staging)?.raw;
        match request {
            UploadRequest::Buffer {
                dst,
                offset: dst_offset,
                data,
            } => {
                let (dst, dst_offset) = (*dst, *dst_offset);
                let Ok(buffer) = device.buffer(dst) else {
                    warn!("Dropping upload for released buffer {dst:?}");
                    return Ok(None);
                };
                if dst_offset + data.len() as u64 > buffer.size {
                    return Err(AshError::AssetError(format!(
                        "Upload of {} bytes at {dst_offset} overruns buffer '{}'",
                        data.len(),
                        buffer.name
                    )));
                }
                device.write_buffer(staging, offset, data)?;
                let region = vk::BufferCopy {
                    src_offset: offset,
                    dst_offset,
                    size: data.len() as u64,
                };
                unsafe {
                    self.device
                        .cmd_copy_buffer(cmd, staging_raw, buffer.raw, &[region])
                };
                self.release_buffer(cmd, buffer.raw);
                Ok(Some(Uploaded::Buffer(dst)))
            }
            UploadRequest::Copy { src, dst, size } => {
                let (src, dst, size) = (*src, *dst, *size);
                let (Ok(source), Ok(buffer)) = (device.buffer(src), device.buffer(dst)) else {
                    warn!("Dropping copy between {src:?} and {dst:?}: released handle");
                    return Ok(None);
                };
                let region = vk::BufferCopy {
                    src_offset: 0,
                    dst_offset: 0,
                    size: size.min(source.size).min(buffer.size),
                };
                unsafe {
                    self.device
                        .cmd_copy_buffer(cmd, source.raw, buffer.raw, &[region])
                };
                self.release_buffer(cmd, buffer.raw);
                Ok(Some(Uploaded::Buffer(dst)))
            }
            UploadRequest::Texture { dst, data } => {
                let dst = *dst;
                let Ok(texture) = device.texture(dst) else {
                    warn!("Dropping upload for released texture {dst:?}");
                    return Ok(None);
                };
                let layers = texture.kind.layers();
                if let Some(texel) = bytes_per_texel(texture.format) {
                    let expected = texel
                        * u64::from(texture.extent.width)
                        * u64::from(texture.extent.height)
                        * u64::from(layers);
                    if expected != data.len() as u64 {
                        return Err(AshError::AssetError(format!(
                            "Texture '{}' expects {expected} bytes, upload has {}",
                            texture.name,
                            data.len()
                        )));
                    }
                }
                device.write_buffer(staging, offset, data)?;

                let range = vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: layers,
                };
                barrier::record(
                    &self.device,
                    cmd,
                    &[],
                    &[barrier::image_transition(
                        texture.image,
                        range,
                        vk::ImageLayout::UNDEFINED,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    )],
                );
                let region = vk::BufferImageCopy::default()
                    .buffer_offset(offset)
                    .image_subresource(vk::ImageSubresourceLayers {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        mip_level: 0,
                        base_array_layer: 0,
                        layer_count: layers,
                    })
                    .image_extent(vk::Extent3D {
                        width: texture.extent.width,
                        height: texture.extent.height,
                        depth: 1,
                    });
                unsafe {
                    self.device.cmd_copy_buffer_to_image(
                        cmd,
                        staging_raw,
                        texture.image,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[region],
                    )
                };
                // Layout stays TRANSFER_DST across the handoff; the main queue builds
                // the mip chain from it after acquiring.
                barrier::record(
                    &self.device,
                    cmd,
                    &[],
                    &[barrier::image_release(
                        texture.image,
                        range,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        self.transfer,
                    )],
                );
                Ok(Some(Uploaded::Texture(dst)))
            }
        }
    }

    fn release_buffer(&self, cmd: vk::CommandBuffer, buffer: vk::Buffer) {
        barrier::record(
            &self.device,
            cmd,
            &[barrier::buffer_release(
                buffer,
                self.transfer,
                vk::PipelineStageFlags2::ALL_TRANSFER,
                vk::AccessFlags2::TRANSFER_WRITE,
            )],
            &[],
        );
    }

    /// Records acquire barriers for every texture whose upload has completed, then
    /// builds their mip chains and swaps their bindless slots over from the default
    /// texel. Returns how many textures became readable.
    pub fn signal_textures(&self, device: &mut Device, cmd: vk::CommandBuffer) -> Result<usize> {
        let pending = std::mem::take(&mut *self.pending_textures.lock());
        let mut ready = Vec::with_capacity(pending.len());
        let mut barriers = Vec::with_capacity(pending.len());
        for handle in pending {
            let Ok(texture) = device.texture(handle) else {
                debug!("Texture {handle:?} released before its upload was signaled");
                continue;
            };
            let range = vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: texture.kind.layers(),
            };
            barriers.push(barrier::image_acquire(
                texture.image,
                range,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                self.transfer,
            ));
            ready.push(handle);
        }
        barrier::record(&self.device, cmd, &[], &barriers);
        for handle in &ready {
            device.record_mip_chain(cmd, *handle)?;
            device.make_texture_resident(*handle)?;
        }
        Ok(ready.len())
    }

    /// Records acquire barriers for every buffer whose upload has completed and
    /// marks them resident. Returns how many buffers became readable.
    pub fn signal_buffers(&self, device: &mut Device, cmd: vk::CommandBuffer) -> Result<usize> {
        let pending = std::mem::take(&mut *self.pending_buffers.lock());
        let mut ready = Vec::with_capacity(pending.len());
        let mut barriers = Vec::with_capacity(pending.len());
        for handle in pending {
            let Ok(buffer) = device.buffer(handle) else {
                debug!("Buffer {handle:?} released before its upload was signaled");
                continue;
            };
            barriers.push(barrier::buffer_acquire(
                buffer.raw,
                self.transfer,
                BUFFER_CONSUMER_STAGES,
                BUFFER_CONSUMER_ACCESS,
            ));
            ready.push(handle);
        }
        barrier::record(&self.device, cmd, &barriers, &[]);
        // Recorded before any consumer in this command buffer, so usable from now on.
        for handle in &ready {
            device.mark_buffer_resident(*handle)?;
        }
        Ok(ready.len())
    }

    /// Waits for outstanding transfers, stops the decode worker and returns the
    /// staging buffers to the device.
    pub fn shutdown(&mut self, device: &mut Device) {
        let fences: Vec<_> = (0..self.slots.len())
            .filter(|slot| self.tracker.is_busy(*slot))
            .map(|slot| self.slots[slot].fence)
            .collect();
        if !fences.is_empty() {
            if let Err(e) = unsafe { self.device.wait_for_fences(&fences, true, u64::MAX) } {
                warn!("Waiting for transfers during shutdown failed: {e:?}");
            }
        }
        self.tracker.clear();
        self.decoder.stop();
        self.uploads.clear();
        for slot in &mut self.slots {
            let staging = std::mem::replace(&mut slot.staging, Handle::INVALID);
            if staging.is_valid() {
                if let Err(e) = device.destroy_buffer(staging) {
                    warn!("Failed to release staging buffer: {e}");
                }
            }
        }
    }
}

impl Drop for AsyncLoader {
    fn drop(&mut self) {
        self.decoder.stop();
        unsafe {
            for slot in &self.slots {
                self.device.destroy_fence(slot.fence, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer_request(index: u32, bytes: usize) -> UploadRequest {
        UploadRequest::Buffer {
            dst: Handle::new(index, 0),
            offset: 0,
            data: vec![0; bytes],
        }
    }

    fn dst_index(request: &UploadRequest) -> u32 {
        match request {
            UploadRequest::Buffer { dst, .. } => dst.index(),
            _ => unreachable!(),
        }
    }

    /// Fence states of a fake transfer queue, polled like `get_fence_status`.
    struct Fences(Vec<bool>);

    impl Fences {
        fn poll(&self, tracker: &mut UploadTracker) -> Vec<Uploaded> {
            tracker.retire_completed(|slot| Ok(self.0[slot])).unwrap()
        }
    }

    #[test]
    fn nothing_is_signaled_before_the_fence() {
        let mut tracker = UploadTracker::new(2);
        let mut fences = Fences(vec![false; 2]);
        let texture = Uploaded::Texture(Handle::new(3, 1));
        tracker.submit(0, vec![texture]);

        assert!(fences.poll(&mut tracker).is_empty());
        assert!(fences.poll(&mut tracker).is_empty());
        assert_eq!(tracker.in_flight(), 1);

        fences.0[0] = true;
        assert_eq!(fences.poll(&mut tracker), vec![texture]);
        assert_eq!(tracker.in_flight(), 0);
        assert!(fences.poll(&mut tracker).is_empty());
    }

    #[test]
    fn last_batch_is_published_without_further_submissions() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut tracker = UploadTracker::new(3);
        let mut fences = Fences(vec![false; 3]);
        let buffer = Uploaded::Buffer(Handle::new(7, 0));

        let slot = tracker.next_free().unwrap();
        tracker.submit(slot, vec![buffer]);
        // The queue is now empty: later frames only poll, and the cursor has
        // moved past the busy slot.
        assert_eq!(tracker.next_free(), Some(1));
        for _ in 0..5 {
            assert!(fences.poll(&mut tracker).is_empty());
        }
        fences.0[slot] = true;
        assert_eq!(fences.poll(&mut tracker), vec![buffer]);
        assert_eq!(tracker.in_flight(), 0);
    }

    #[test]
    fn idle_slots_are_never_polled() {
        let mut tracker = UploadTracker::new(3);
        tracker.submit(1, vec![Uploaded::Buffer(Handle::new(0, 0))]);
        let mut polled = Vec::new();
        let done = tracker
            .retire_completed(|slot| {
                polled.push(slot);
                Ok(false)
            })
            .unwrap();
        assert!(done.is_empty());
        assert_eq!(polled, vec![1]);
    }

    #[test]
    fn slots_complete_out_of_order() {
        let mut tracker = UploadTracker::new(2);
        let mut fences = Fences(vec![false; 2]);
        tracker.submit(0, vec![Uploaded::Buffer(Handle::new(0, 0))]);
        tracker.submit(1, vec![Uploaded::Buffer(Handle::new(1, 0))]);
        assert_eq!(tracker.next_free(), None);

        fences.0[1] = true;
        assert_eq!(
            fences.poll(&mut tracker),
            vec![Uploaded::Buffer(Handle::new(1, 0))]
        );
        assert!(tracker.is_busy(0));
        assert_eq!(tracker.next_free(), Some(1));
    }

    #[test]
    fn fence_errors_keep_the_slot_in_flight() {
        let mut tracker = UploadTracker::new(2);
        tracker.submit(0, vec![Uploaded::Buffer(Handle::new(0, 0))]);
        let lost = tracker.retire_completed(|_| Err(AshError::VulkanError("device lost".into())));
        assert!(matches!(lost, Err(AshError::VulkanError(_))));
        assert!(tracker.is_busy(0));
    }

    #[test]
    fn failed_batch_returns_to_the_head_of_the_queue() {
        let staging = StagingAllocator::new(64);
        let mut queue: VecDeque<_> = (0..4).map(|index| buffer_request(index, 24)).collect();

        let batch = plan_epoch(&mut queue, &staging);
        assert_eq!(batch.len(), 2);
        staging.reset();
        requeue(&mut queue, batch);

        let order: Vec<_> = queue.iter().map(dst_index).collect();
        assert_eq!(order, vec![0, 1, 2, 3]);
        assert_eq!(staging.used(), 0);
    }

    #[test]
    fn staging_rejects_oversized_and_defers_overflowing_requests() {
        let staging = StagingAllocator::new(64);
        assert!(matches!(
            staging.allocate(65),
            Err(AshError::StagingOverflow {
                requested: 65,
                capacity: 64
            })
        ));
        assert_eq!(staging.allocate(10).unwrap(), Some(0));
        assert_eq!(staging.allocate(30).unwrap(), Some(16));
        assert_eq!(staging.allocate(20).unwrap(), None);
        assert_eq!(staging.allocate(8).unwrap(), Some(48));
        assert_eq!(staging.used(), 56);
        staging.reset();
        assert_eq!(staging.allocate(64).unwrap(), Some(0));
    }

    #[test]
    fn epochs_preserve_submission_order() {
        let staging = StagingAllocator::new(100);
        let mut queue: VecDeque<_> = [
            buffer_request(0, 40),
            buffer_request(1, 500),
            buffer_request(2, 40),
            buffer_request(3, 40),
            buffer_request(4, 8),
        ]
        .into_iter()
        .collect();

        let first: Vec<_> = plan_epoch(&mut queue, &staging)
            .iter()
            .map(|(request, _)| dst_index(request))
            .collect();
        // Request 1 can never fit and is dropped; request 3 waits for the next epoch
        // even though request 4 would still fit.
        assert_eq!(first, vec![0, 2]);
        assert_eq!(queue.len(), 2);

        staging.reset();
        let second: Vec<_> = plan_epoch(&mut queue, &staging)
            .iter()
            .map(|(request, _)| dst_index(request))
            .collect();
        assert_eq!(second, vec![3, 4]);
        assert!(queue.is_empty());
    }

    #[test]
    fn decodes_image_files_to_rgba() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checker.png");
        image::RgbImage::from_fn(3, 2, |x, y| image::Rgb([(x * 80) as u8, (y * 120) as u8, 7]))
            .save(&path)
            .unwrap();

        let request = FileRequest {
            path,
            target: FileTarget::Texture(Handle::new(0, 0)),
        };
        match decode(&request).unwrap() {
            UploadRequest::Texture { data, .. } => {
                assert_eq!(data.len(), 3 * 2 * 4);
                assert_eq!(&data[4..8], &[80, 0, 7, 255]);
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn corrupt_files_never_produce_uploads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.png");
        std::fs::write(&path, b"not a png").unwrap();
        let request = FileRequest {
            path,
            target: FileTarget::Texture(Handle::new(0, 0)),
        };
        assert!(matches!(decode(&request), Err(AshError::AssetError(_))));

        let missing = FileRequest {
            path: dir.path().join("missing.bin"),
            target: FileTarget::Buffer(Handle::new(0, 0)),
        };
        assert!(matches!(decode(&missing), Err(AshError::Io(_))));
    }

    #[test]
    fn worker_round_trips_requests() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.bin");
        std::fs::write(&path, [1u8, 2, 3]).unwrap();

        let mut worker = DecodeWorker::spawn().unwrap();
        worker
            .send(FileRequest {
                path: path.clone(),
                target: FileTarget::Buffer(Handle::new(5, 2)),
            })
            .unwrap();
        let (done_path, outcome) = worker
            .results
            .recv_timeout(std::time::Duration::from_secs(5))
            .unwrap();
        assert_eq!(done_path, path);
        assert_eq!(outcome.unwrap().staging_size(), 3);
        worker.stop();
        assert!(worker.send(FileRequest {
            path,
            target: FileTarget::Buffer(Handle::new(5, 2)),
        })
        .is_err());
    }
}
