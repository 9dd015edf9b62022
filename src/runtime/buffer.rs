//! Host buffers and their C-layout descriptor.
//!
//! A [`Buffer`] owns aligned host storage and a [`RawBuffer`] that compiled
//! code reads and writes through a raw pointer. The descriptor lives in its
//! own heap cell so its address stays put when the `Buffer` moves.

use std::cell::UnsafeCell;
use std::fmt;

use thiserror::Error;
use tracing::trace;

use crate::ir::types::{Element, Scalar, Type};

pub const MAX_DIMS: usize = 4;

/// The buffer descriptor compiled code sees.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct RawBuffer {
    /// Device allocation handle; zero when there is none.
    pub dev: u64,
    pub host: *mut u8,
    pub extent: [i32; MAX_DIMS],
    pub stride: [i32; MAX_DIMS],
    pub min: [i32; MAX_DIMS],
    pub elem_size: i32,
    pub host_dirty: bool,
    pub dev_dirty: bool,
}

/// Signature of the `__copy_to_host` and `__free_buffer` hooks.
pub type BufferHook = unsafe extern "C" fn(*mut RawBuffer);

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BufferError {
    #[error("buffers have at most {MAX_DIMS} dimensions, got {0}")]
    TooManyDimensions(usize),
    #[error("extent {0} is negative")]
    NegativeExtent(i32),
    #[error("element type {0} cannot be stored in a buffer")]
    UnstorableType(Type),
    #[error("buffer holds {found}, not {expected}")]
    TypeMismatch { expected: Type, found: Type },
    #[error("expected {expected} elements, got {found}")]
    LengthMismatch { expected: usize, found: usize },
    #[error("coordinates {0:?} are outside the buffer")]
    OutOfBounds(Vec<i32>),
    #[error("buffer contents are on the device; call copy_to_host first")]
    DeviceDirty,
    #[error("buffer contents are on the device and no copy hook is attached")]
    NoCopyHook,
}

pub struct Buffer {
    ty: Type,
    dims: usize,
    storage: Vec<u64>,
    raw: Box<UnsafeCell<RawBuffer>>,
    copy_to_host: Option<BufferHook>,
    free: Option<BufferHook>,
}

// The descriptor is only mutated through `&mut self` or by compiled code
// while the caller holds the buffer exclusively for the run.
unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

impl Buffer {
    /// A zero-filled dense buffer of `ty` with the given extents, innermost
    /// dimension first.
    pub fn new(ty: Type, extents: &[i32]) -> Result<Self, BufferError> {
        if extents.len() > MAX_DIMS {
            return Err(BufferError::TooManyDimensions(extents.len()));
        }
        if let Some(&e) = extents.iter().find(|&&e| e < 0) {
            return Err(BufferError::NegativeExtent(e));
        }
        if !ty.is_storable() {
            return Err(BufferError::UnstorableType(ty));
        }
        let len: usize = extents.iter().map(|&e| e as usize).product();
        let bytes = len * ty.bytes();
        let mut storage = vec![0u64; bytes.div_ceil(8)];

        let mut raw = RawBuffer {
            dev: 0,
            host: storage.as_mut_ptr() as *mut u8,
            extent: [0; MAX_DIMS],
            stride: [0; MAX_DIMS],
            min: [0; MAX_DIMS],
            elem_size: ty.bytes() as i32,
            host_dirty: false,
            dev_dirty: false,
        };
        let mut stride = 1;
        for (i, &e) in extents.iter().enumerate() {
            raw.extent[i] = e;
            raw.stride[i] = stride;
            stride *= e;
        }
        trace!(%ty, ?extents, "allocated buffer");
        Ok(Buffer {
            ty,
            dims: extents.len(),
            storage,
            raw: Box::new(UnsafeCell::new(raw)),
            copy_to_host: None,
            free: None,
        })
    }

    /// A buffer initialized from `data`, laid out innermost dimension first.
    pub fn from_slice<T: Element>(extents: &[i32], data: &[T]) -> Result<Self, BufferError> {
        let mut buf = Buffer::new(T::TYPE, extents)?;
        let expected = buf.len();
        if data.len() != expected {
            return Err(BufferError::LengthMismatch {
                expected,
                found: data.len(),
            });
        }
        buf.data_mut::<T>()?.copy_from_slice(data);
        Ok(buf)
    }

    fn desc(&self) -> &RawBuffer {
        // SAFETY: shared reads; writers need `&mut self` or own the run.
        unsafe { &*self.raw.get() }
    }

    fn desc_mut(&mut self) -> &mut RawBuffer {
        self.raw.get_mut()
    }

    pub fn ty(&self) -> Type {
        self.ty
    }

    pub fn dimensions(&self) -> usize {
        self.dims
    }

    pub fn extent(&self, dim: usize) -> i32 {
        self.desc().extent[dim]
    }

    pub fn extents(&self) -> Vec<i32> {
        self.desc().extent[..self.dims].to_vec()
    }

    pub fn min(&self, dim: usize) -> i32 {
        self.desc().min[dim]
    }

    pub fn stride(&self, dim: usize) -> i32 {
        self.desc().stride[dim]
    }

    /// Move the origin of the buffer's coordinate space.
    pub fn set_min(&mut self, mins: &[i32]) {
        let dims = self.dims;
        for (slot, &m) in self.desc_mut().min[..dims].iter_mut().zip(mins) {
            *slot = m;
        }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.desc().extent[..self.dims]
            .iter()
            .map(|&e| e as usize)
            .product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_view<T: Element>(&self) -> Result<(), BufferError> {
        let compatible = T::TYPE == self.ty || (self.ty == Type::BOOL && T::TYPE == Type::UInt(8));
        if !compatible {
            return Err(BufferError::TypeMismatch {
                expected: T::TYPE,
                found: self.ty,
            });
        }
        if self.desc().dev_dirty {
            return Err(BufferError::DeviceDirty);
        }
        Ok(())
    }

    /// The elements as a host slice.
    pub fn data<T: Element>(&self) -> Result<&[T], BufferError> {
        self.check_view::<T>()?;
        let len = self.len();
        Ok(&bytemuck::cast_slice::<u64, T>(&self.storage)[..len])
    }

    pub fn data_mut<T: Element>(&mut self) -> Result<&mut [T], BufferError> {
        self.check_view::<T>()?;
        let len = self.len();
        Ok(&mut bytemuck::cast_slice_mut::<u64, T>(&mut self.storage)[..len])
    }

    /// Flat element offset of `coords`, or `None` outside the buffer.
    pub fn offset(&self, coords: &[i32]) -> Option<usize> {
        let desc = self.desc();
        if coords.len() != self.dims {
            return None;
        }
        let mut offset = 0usize;
        for (i, &c) in coords.iter().enumerate() {
            let local = c - desc.min[i];
            if local < 0 || local >= desc.extent[i] {
                return None;
            }
            offset += local as usize * desc.stride[i] as usize;
        }
        Some(offset)
    }

    pub fn get<T: Element>(&self, coords: &[i32]) -> Result<T, BufferError> {
        let data = self.data::<T>()?;
        self.offset(coords)
            .map(|i| data[i])
            .ok_or_else(|| BufferError::OutOfBounds(coords.to_vec()))
    }

    /// Read element `index` through the descriptor's host pointer.
    ///
    /// # Safety
    /// `index` must be in range and no other thread may be writing the same
    /// element.
    pub(crate) unsafe fn load_raw(raw: *const RawBuffer, ty: Type, index: usize) -> Scalar {
        let size = ty.bytes();
        let host = (*raw).host.add(index * size);
        Scalar::load(ty, std::slice::from_raw_parts(host, size))
    }

    /// Write element `index` through the descriptor's host pointer.
    ///
    /// # Safety
    /// `index` must be in range and no other thread may write the same
    /// element concurrently.
    pub(crate) unsafe fn store_raw(raw: *mut RawBuffer, ty: Type, index: usize, value: Scalar) {
        let size = ty.bytes();
        let host = (*raw).host.add(index * size);
        let slot = std::slice::from_raw_parts_mut(host, size);
        value.store(ty, slot);
    }

    /// Pointer to the descriptor handed to compiled code.
    pub fn raw(&self) -> *mut RawBuffer {
        self.raw.get()
    }

    pub fn host_dirty(&self) -> bool {
        self.desc().host_dirty
    }

    pub fn dev_dirty(&self) -> bool {
        self.desc().dev_dirty
    }

    /// Record that the host copy holds the latest contents.
    pub fn mark_host_written(&mut self) {
        let desc = self.desc_mut();
        desc.host_dirty = true;
        desc.dev_dirty = false;
    }

    /// Record that the latest contents live on the device.
    pub fn mark_device_written(&mut self) {
        let desc = self.desc_mut();
        desc.dev_dirty = true;
        desc.host_dirty = false;
    }

    pub fn attach_hooks(&mut self, copy_to_host: BufferHook, free: Option<BufferHook>) {
        self.copy_to_host = Some(copy_to_host);
        self.free = free;
    }

    /// Bring device contents back to the host if they are newer.
    pub fn copy_to_host(&mut self) -> Result<(), BufferError> {
        if !self.desc().dev_dirty {
            return Ok(());
        }
        let hook = self.copy_to_host.ok_or(BufferError::NoCopyHook)?;
        // SAFETY: the hook was resolved from the module that produced the
        // device contents and receives exclusive access to the descriptor.
        unsafe { hook(self.raw.get()) };
        self.desc_mut().dev_dirty = false;
        trace!("copied buffer to host");
        Ok(())
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(free) = self.free {
            // SAFETY: the descriptor is still alive and exclusively ours.
            unsafe { free(self.raw.get()) };
        }
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Buffer({}, {:?})", self.ty, self.extents())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_dense_strides() {
        let buf = Buffer::new(Type::f32(), &[4, 3, 2]).unwrap();
        assert_eq!(buf.len(), 24);
        assert_eq!(buf.stride(0), 1);
        assert_eq!(buf.stride(1), 4);
        assert_eq!(buf.stride(2), 12);
        assert_eq!(unsafe { (*buf.raw()).elem_size }, 4);
    }

    #[test]
    fn test_from_slice_and_get() {
        let buf = Buffer::from_slice(&[3, 2], &[1i32, 2, 3, 4, 5, 6]).unwrap();
        assert_eq!(buf.get::<i32>(&[2, 1]).unwrap(), 6);
        assert_eq!(
            buf.get::<i32>(&[3, 0]),
            Err(BufferError::OutOfBounds(vec![3, 0]))
        );
    }

    #[test]
    fn test_min_shifts_coordinates() {
        let mut buf = Buffer::from_slice(&[4], &[10u8, 11, 12, 13]).unwrap();
        buf.set_min(&[-2]);
        assert_eq!(buf.get::<u8>(&[-2]).unwrap(), 10);
        assert_eq!(buf.get::<u8>(&[1]).unwrap(), 13);
    }

    #[test]
    fn test_type_checked_views() {
        let buf = Buffer::new(Type::f32(), &[8]).unwrap();
        assert!(matches!(
            buf.data::<i32>(),
            Err(BufferError::TypeMismatch { .. })
        ));
        let flags = Buffer::new(Type::BOOL, &[8]).unwrap();
        assert_eq!(flags.data::<u8>().unwrap().len(), 8);
    }

    #[test]
    fn test_bad_shapes() {
        assert_eq!(
            Buffer::new(Type::i32(), &[1, 1, 1, 1, 1]).unwrap_err(),
            BufferError::TooManyDimensions(5)
        );
        assert_eq!(
            Buffer::new(Type::i32(), &[-1]).unwrap_err(),
            BufferError::NegativeExtent(-1)
        );
        assert_eq!(
            Buffer::from_slice(&[3], &[1.0f32]).unwrap_err(),
            BufferError::LengthMismatch {
                expected: 3,
                found: 1
            }
        );
    }

    static COPIES: AtomicUsize = AtomicUsize::new(0);
    static FREES: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn copy_hook(raw: *mut RawBuffer) {
        COPIES.fetch_add(1, Ordering::SeqCst);
        *((*raw).host as *mut i32) = 42;
    }

    unsafe extern "C" fn free_hook(_raw: *mut RawBuffer) {
        FREES.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn test_device_hooks() {
        let mut buf = Buffer::new(Type::i32(), &[2]).unwrap();
        buf.attach_hooks(copy_hook, Some(free_hook));
        buf.mark_device_written();
        assert_eq!(buf.data::<i32>().unwrap_err(), BufferError::DeviceDirty);
        buf.copy_to_host().unwrap();
        assert_eq!(buf.data::<i32>().unwrap(), &[42, 0]);
        buf.copy_to_host().unwrap();
        assert_eq!(COPIES.load(Ordering::SeqCst), 1);
        drop(buf);
        assert_eq!(FREES.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_device_dirty_without_hook() {
        let mut buf = Buffer::new(Type::i32(), &[2]).unwrap();
        buf.mark_device_written();
        assert_eq!(buf.copy_to_host().unwrap_err(), BufferError::NoCopyHook);
    }
}
