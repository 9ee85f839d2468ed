//! Accelerator boundary.
//!
//! A device backend is reached only through four operations: allocate, push,
//! pull and free. Layers mirror their persistent parameters through this
//! trait; host code may only observe device results after an explicit pull.
//! [`HostDevice`] is a memory-backed implementation used on machines without a
//! device and in tests.

use std::collections::HashMap;

use thiserror::Error;

/// Opaque handle to a device allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(u64);

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AcceleratorError {
    #[error("unknown device handle {0:?}")]
    UnknownHandle(DeviceHandle),
    #[error("device buffer holds {device} elements, host buffer holds {host}")]
    LengthMismatch { device: usize, host: usize },
}

/// Call contract of a device backend.
pub trait Accelerator {
    /// Reserves a zero-filled device buffer of `n` elements.
    fn allocate(&mut self, n: usize) -> Result<DeviceHandle, AcceleratorError>;

    /// Copies `host` into a new device buffer.
    fn push(&mut self, host: &[f32]) -> Result<DeviceHandle, AcceleratorError>;

    /// Copies a device buffer back to host memory.
    fn pull(&self, handle: DeviceHandle) -> Result<Vec<f32>, AcceleratorError>;

    /// Releases a device buffer. The handle is invalid afterwards.
    fn free(&mut self, handle: DeviceHandle) -> Result<(), AcceleratorError>;
}

/// In-memory backend with the same observable behaviour as a real device.
#[derive(Debug, Default)]
pub struct HostDevice {
    buffers: HashMap<DeviceHandle, Vec<f32>>,
    next_id: u64,
}

impl HostDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live allocations.
    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    fn insert(&mut self, data: Vec<f32>) -> DeviceHandle {
        let handle = DeviceHandle(self.next_id);
        self.next_id += 1;
        self.buffers.insert(handle, data);
        handle
    }
}

impl Accelerator for HostDevice {
    fn allocate(&mut self, n: usize) -> Result<DeviceHandle, AcceleratorError> {
        Ok(self.insert(vec![0.0; n]))
    }

    fn push(&mut self, host: &[f32]) -> Result<DeviceHandle, AcceleratorError> {
        Ok(self.insert(host.to_vec()))
    }

    fn pull(&self, handle: DeviceHandle) -> Result<Vec<f32>, AcceleratorError> {
        self.buffers
            .get(&handle)
            .cloned()
            .ok_or(AcceleratorError::UnknownHandle(handle))
    }

    fn free(&mut self, handle: DeviceHandle) -> Result<(), AcceleratorError> {
        self.buffers
            .remove(&handle)
            .map(|_| ())
            .ok_or(AcceleratorError::UnknownHandle(handle))
    }
}

/// Pulls `handle` into an existing host buffer of the same length.
pub fn pull_into(
    device: &dyn Accelerator,
    handle: DeviceHandle,
    host: &mut [f32],
) -> Result<(), AcceleratorError> {
    let data = device.pull(handle)?;
    if data.len() != host.len() {
        return Err(AcceleratorError::LengthMismatch {
            device: data.len(),
            host: host.len(),
        });
    }
    host.copy_from_slice(&data);
    Ok(())
}

/// Replaces NaN and infinite entries with `0.0`.
///
/// Returns the number of entries that were replaced.
pub fn fix_nan_and_inf(buffer: &mut [f32]) -> usize {
    let mut fixed = 0;
    for value in buffer.iter_mut() {
        if !value.is_finite() {
            *value = 0.0;
            fixed += 1;
        }
    }
    fixed
}

/// Device mirror of a set of host buffers, in push order.
#[derive(Debug, Default)]
pub struct DeviceMirror {
    handles: Vec<DeviceHandle>,
}

impl DeviceMirror {
    /// Pushes every buffer, releasing any previous mirror first.
    pub fn push_all(
        &mut self,
        device: &mut dyn Accelerator,
        buffers: &[&[f32]],
    ) -> Result<(), AcceleratorError> {
        self.release(device)?;
        for buffer in buffers {
            let handle = device.push(buffer)?;
            self.handles.push(handle);
        }
        Ok(())
    }

    /// Pulls the mirrored buffers back in the order they were pushed.
    pub fn pull_all(
        &self,
        device: &dyn Accelerator,
        buffers: &mut [&mut [f32]],
    ) -> Result<(), AcceleratorError> {
        for (handle, buffer) in self.handles.iter().zip(buffers.iter_mut()) {
            pull_into(device, *handle, &mut buffer[..])?;
        }
        Ok(())
    }

    pub fn release(&mut self, device: &mut dyn Accelerator) -> Result<(), AcceleratorError> {
        for handle in self.handles.drain(..) {
            device.free(handle)?;
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pull_roundtrip() {
        let mut device = HostDevice::new();
        let handle = device.push(&[1.0, 2.0, 3.0]).unwrap();
        assert_eq!(device.pull(handle).unwrap(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_allocate_is_zeroed() {
        let mut device = HostDevice::new();
        let handle = device.allocate(4).unwrap();
        assert_eq!(device.pull(handle).unwrap(), vec![0.0; 4]);
    }

    #[test]
    fn test_free_invalidates_handle() {
        let mut device = HostDevice::new();
        let handle = device.allocate(2).unwrap();
        device.free(handle).unwrap();
        assert_eq!(
            device.pull(handle),
            Err(AcceleratorError::UnknownHandle(handle))
        );
        assert!(device.free(handle).is_err());
    }

    #[test]
    fn test_pull_into_length_mismatch() {
        let mut device = HostDevice::new();
        let handle = device.push(&[1.0, 2.0]).unwrap();
        let mut host = [0.0f32; 3];
        let err = pull_into(&device, handle, &mut host).unwrap_err();
        assert_eq!(err, AcceleratorError::LengthMismatch { device: 2, host: 3 });
    }

    #[test]
    fn test_fix_nan_and_inf() {
        let mut buffer = [1.0, f32::NAN, f32::INFINITY, -2.0, f32::NEG_INFINITY];
        assert_eq!(fix_nan_and_inf(&mut buffer), 3);
        assert_eq!(buffer, [1.0, 0.0, 0.0, -2.0, 0.0]);
    }

    #[test]
    fn test_mirror_push_replaces_previous_allocations() {
        let mut device = HostDevice::new();
        let mut mirror = DeviceMirror::default();
        let a = [1.0f32, 2.0];
        let b = [3.0f32];
        mirror.push_all(&mut device, &[&a[..], &b[..]]).unwrap();
        mirror.push_all(&mut device, &[&a[..], &b[..]]).unwrap();
        assert_eq!(device.live_buffers(), 2);

        let mut a_back = [0.0f32; 2];
        let mut b_back = [0.0f32; 1];
        mirror
            .pull_all(&device, &mut [&mut a_back[..], &mut b_back[..]])
            .unwrap();
        assert_eq!(a_back, a);
        assert_eq!(b_back, b);

        mirror.release(&mut device).unwrap();
        assert_eq!(device.live_buffers(), 0);
        assert!(mirror.is_empty());
    }
}
