//! CPU-side staging memory for one frame's planes
//!
//! Each plane lives either in plain host memory or in a transfer buffer that the
//! backend maps for host writes. Transfer buffer contents start at the offset the
//! backend capabilities ask for; some drivers corrupt the alpha channel when
//! uploading from offset zero.

use crate::{
    backend::{GraphicsBackend, TransferBufferHandle, UploadSource},
    error::BackendError,
    format::{MAX_PLANES, PlaneGeometry},
};

/// Backing memory of one plane
#[derive(Debug)]
pub(crate) enum PlaneStorage {
    /// The plane is not used by the layout
    Empty,
    Host(Vec<u8>),
    Transfer { buffer: TransferBufferHandle, size: usize },
}

/// Staging memory for all planes of a frame
#[derive(Debug)]
pub(crate) struct StagingImage {
    pub geometry: PlaneGeometry,
    planes: [PlaneStorage; MAX_PLANES],
    /// Transfer buffers are currently mapped for host writes
    mapped: bool,
    /// Byte offset of plane data inside the transfer buffers
    offset: usize,
}

impl StagingImage {
    /// Allocates host memory for every used plane
    pub fn host(geometry: PlaneGeometry) -> Self {
        let planes = geometry.sizes.map(|size| if size == 0 { PlaneStorage::Empty } else { PlaneStorage::Host(vec![0; size]) });
        Self {
            geometry,
            planes,
            mapped: false,
            offset: 0,
        }
    }

    /// Allocates one mapped transfer buffer per used plane
    ///
    /// Plane data starts `offset` bytes into each buffer. On failure every buffer
    /// allocated so far is deleted again.
    pub fn with_transfer_buffers(backend: &mut dyn GraphicsBackend, geometry: PlaneGeometry, offset: usize) -> Result<Self, BackendError> {
        let mut planes = [PlaneStorage::Empty, PlaneStorage::Empty, PlaneStorage::Empty];
        for (plane, &size) in geometry.sizes.iter().enumerate() {
            if size == 0 {
                continue;
            }
            match backend.create_transfer_buffer(size + offset) {
                Ok(buffer) => planes[plane] = PlaneStorage::Transfer { buffer, size },
                Err(e) => {
                    for storage in planes {
                        if let PlaneStorage::Transfer { buffer, .. } = storage {
                            backend.delete_transfer_buffer(buffer);
                        }
                    }
                    return Err(e);
                }
            }
        }

        Ok(Self {
            geometry,
            planes,
            mapped: true,
            offset,
        })
    }

    pub fn uses_transfer_buffers(&self) -> bool {
        self.planes.iter().any(|plane| matches!(plane, PlaneStorage::Transfer { .. }))
    }

    /// Maps the transfer buffers for host writes if they were handed to the GPU
    pub fn map(&mut self, backend: &mut dyn GraphicsBackend) -> Result<(), BackendError> {
        if self.mapped || !self.uses_transfer_buffers() {
            return Ok(());
        }
        for plane in &self.planes {
            if let PlaneStorage::Transfer { buffer, .. } = plane {
                backend.map_transfer_buffer(*buffer)?;
            }
        }
        self.mapped = true;
        Ok(())
    }

    /// Hands the transfer buffers back to the GPU
    pub fn unmap(&mut self, backend: &mut dyn GraphicsBackend) {
        if !self.mapped {
            return;
        }
        for plane in &self.planes {
            if let PlaneStorage::Transfer { buffer, .. } = plane {
                backend.unmap_transfer_buffer(*buffer);
            }
        }
        self.mapped = false;
    }

    /// Gives `write` mutable access to the bytes of `plane`
    pub fn write_plane(&mut self, backend: &mut dyn GraphicsBackend, plane: usize, write: &mut dyn FnMut(&mut [u8])) -> Result<(), BackendError> {
        match &mut self.planes[plane] {
            PlaneStorage::Empty => Ok(()),
            PlaneStorage::Host(data) => {
                write(data);
                Ok(())
            }
            PlaneStorage::Transfer { buffer, size } => {
                if !self.mapped {
                    return Err(BackendError::MapFailed(buffer.0));
                }
                backend.write_transfer_buffer(*buffer, self.offset, *size, write)
            }
        }
    }

    /// Upload source and base offset of `plane`
    pub fn upload_source(&self, plane: usize) -> Option<(UploadSource<'_>, usize)> {
        match &self.planes[plane] {
            PlaneStorage::Empty => None,
            PlaneStorage::Host(data) => Some((UploadSource::Host(data), 0)),
            PlaneStorage::Transfer { buffer, .. } => Some((UploadSource::Transfer(*buffer), self.offset)),
        }
    }

    /// Returns the transfer buffers to the backend and drops host memory
    pub fn release(self, backend: &mut dyn GraphicsBackend) {
        for plane in self.planes {
            if let PlaneStorage::Transfer { buffer, .. } = plane {
                backend.delete_transfer_buffer(buffer);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{format::PixelFormat, test_support::FakeBackend};

    #[test]
    fn test_host_storage_skips_unused_planes() {
        let image = StagingImage::host(PlaneGeometry::new(PixelFormat::Nv12, 16, 16, 1, 1));
        assert!(matches!(image.planes[0], PlaneStorage::Host(ref data) if data.len() == 256));
        assert!(matches!(image.planes[2], PlaneStorage::Empty));
        assert!(!image.uses_transfer_buffers());
        assert!(image.upload_source(2).is_none());
    }

    #[test]
    fn test_transfer_buffers_carry_offset() {
        let mut backend = FakeBackend::new();
        let geometry = PlaneGeometry::new(PixelFormat::Yuv420P, 16, 16, 1, 1);
        let image = StagingImage::with_transfer_buffers(&mut backend, geometry, 16).unwrap();
        assert_eq!(backend.transfer_buffer_sizes(), vec![256 + 16, 64 + 16, 64 + 16]);
        assert!(matches!(image.upload_source(1), Some((UploadSource::Transfer(_), 16))));
        image.release(&mut backend);
        assert!(backend.transfer_buffer_sizes().is_empty());
    }

    #[test]
    fn test_partial_transfer_allocation_is_released() {
        let mut backend = FakeBackend::new();
        backend.fail_transfer_buffer_after = Some(1);
        let geometry = PlaneGeometry::new(PixelFormat::Yuv420P, 16, 16, 1, 1);
        assert!(StagingImage::with_transfer_buffers(&mut backend, geometry, 16).is_err());
        assert!(backend.transfer_buffer_sizes().is_empty());
    }

    #[test]
    fn test_write_requires_mapping() {
        let mut backend = FakeBackend::new();
        let geometry = PlaneGeometry::new(PixelFormat::Yuyv422, 4, 2, 1, 1);
        let mut image = StagingImage::with_transfer_buffers(&mut backend, geometry, 16).unwrap();

        image.write_plane(&mut backend, 0, &mut |data| data.fill(7)).unwrap();
        image.unmap(&mut backend);
        assert!(image.write_plane(&mut backend, 0, &mut |data| data.fill(9)).is_err());

        image.map(&mut backend).unwrap();
        image.write_plane(&mut backend, 0, &mut |data| data[0] = 1).unwrap();
        let Some((UploadSource::Transfer(buffer), _)) = image.upload_source(0) else {
            panic!("Expected a transfer buffer");
        };
        assert_eq!(&backend.transfer_buffer_data(buffer)[16..19], &[1, 7, 7]);
    }
}
