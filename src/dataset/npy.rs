//! Reading and writing NumPy `.npy` arrays
//!
//! Files are memory-mapped and decoded to `f32` volumes. Aligned `<f4` files
//! are viewed in place; any other supported element type is read and
//! converted. Only 4-D arrays are accepted since every file this crate
//! consumes is an NHWC image or mask volume.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use memmap2::MmapOptions;
use ndarray::{Array4, ArrayView4};
use ndarray_npy::{
    ReadNpyError, ReadNpyExt, ReadableElement, ViewNpyError, ViewNpyExt, WriteNpyExt,
};

use crate::dataset::volume::Volume;
use crate::utils::error::{Result, UNetError};

/// Decoded shape and values, or `None` for a different element type
type Decoded = Option<([usize; 4], Vec<f32>)>;

type Reader = fn(&[u8]) -> std::result::Result<Decoded, ReadNpyError>;

fn npy_error(path: &Path, reason: impl Into<String>) -> UNetError {
    UNetError::Npy {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

/// Read `bytes` as a 4-D array of `A`
///
/// `Ok(None)` means the file holds a different element type.
fn read_as<A: ReadableElement>(
    bytes: &[u8],
    to_f32: fn(A) -> f32,
) -> std::result::Result<Decoded, ReadNpyError> {
    match Array4::<A>::read_npy(bytes) {
        Ok(array) => {
            let (n, h, w, c) = array.dim();
            Ok(Some(([n, h, w, c], array.into_iter().map(to_f32).collect())))
        }
        Err(ReadNpyError::WrongDescriptor(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

fn decode(bytes: &[u8]) -> std::result::Result<([usize; 4], Vec<f32>), String> {
    let readers: [Reader; 7] = [
        |b| read_as::<f64>(b, |v| v as f32),
        |b| read_as::<u8>(b, f32::from),
        |b| read_as::<bool>(b, |v| if v { 1.0 } else { 0.0 }),
        |b| read_as::<i16>(b, f32::from),
        |b| read_as::<u16>(b, f32::from),
        |b| read_as::<i32>(b, |v| v as f32),
        |b| read_as::<i64>(b, |v| v as f32),
    ];
    for read in readers {
        if let Some(decoded) = read(bytes).map_err(|e| e.to_string())? {
            return Ok(decoded);
        }
    }
    Err("unsupported element type".to_string())
}

/// Memory-map a 4-D `.npy` file and decode it into a volume
///
/// Malformed headers, truncated payloads and declared sizes that overflow
/// are reported as [`UNetError::Npy`].
pub fn read_volume(path: &Path) -> Result<Volume> {
    if !path.exists() {
        return Err(UNetError::PathNotFound(path.to_path_buf()));
    }
    let file = File::open(path)?;
    let mmap = unsafe { MmapOptions::new().map(&file)? };
    let bytes = &mmap[..];

    let (shape, data) = match ArrayView4::<f32>::view_npy(bytes) {
        Ok(view) => {
            let (n, h, w, c) = view.dim();
            ([n, h, w, c], view.iter().copied().collect())
        }
        Err(ViewNpyError::WrongDescriptor(_)) => {
            decode(bytes).map_err(|reason| npy_error(path, reason))?
        }
        Err(ViewNpyError::MisalignedData) => {
            read_as::<f32>(bytes, |v| v)
                .map_err(|e| npy_error(path, e.to_string()))?
                .ok_or_else(|| npy_error(path, "unsupported element type"))?
        }
        Err(e) => return Err(npy_error(path, e.to_string())),
    };
    Volume::new(shape, data)
}

/// Write a volume as a C-order `float32` `.npy` file
pub fn write_volume(path: &Path, volume: &Volume) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let [n, h, w, c] = volume.shape();
    let view = ArrayView4::from_shape((n, h, w, c), volume.data())
        .map_err(|e| npy_error(path, e.to_string()))?;

    let mut writer = BufWriter::new(File::create(path)?);
    view.write_npy(&mut writer)
        .map_err(|e| npy_error(path, e.to_string()))?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array1, ShapeBuilder};

    fn write_array<A: ndarray_npy::WritableElement>(path: &Path, array: &Array4<A>) {
        array.write_npy(File::create(path).unwrap()).unwrap();
    }

    #[test]
    fn test_read_u8_masks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("msks_train.npy");
        let masks = Array4::<u8>::from_shape_vec((1, 2, 1, 2), vec![0, 1, 1, 0]).unwrap();
        write_array(&path, &masks);

        let vol = read_volume(&path).unwrap();
        assert_eq!(vol.shape(), [1, 2, 1, 2]);
        assert_eq!(vol.data(), &[0.0, 1.0, 1.0, 0.0]);
    }

    #[test]
    fn test_read_bool_and_f64() {
        let dir = tempfile::tempdir().unwrap();

        let masks = dir.path().join("bool.npy");
        let values = vec![true, false, false, true];
        write_array(&masks, &Array4::from_shape_vec((1, 1, 2, 2), values).unwrap());
        assert_eq!(read_volume(&masks).unwrap().data(), &[1.0, 0.0, 0.0, 1.0]);

        let images = dir.path().join("f64.npy");
        let values = vec![0.5f64, -1.25, 3.0];
        write_array(&images, &Array4::from_shape_vec((1, 1, 1, 3), values).unwrap());
        assert_eq!(read_volume(&images).unwrap().data(), &[0.5, -1.25, 3.0]);
    }

    #[test]
    fn test_fortran_order_is_read_in_logical_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fortran.npy");
        let array =
            Array4::from_shape_vec((1, 2, 2, 1).f(), vec![1.0f32, 2.0, 3.0, 4.0]).unwrap();
        write_array(&path, &array);

        let vol = read_volume(&path).unwrap();
        let expected: Vec<f32> = array.iter().copied().collect();
        assert_eq!(vol.data(), expected.as_slice());
    }

    #[test]
    fn test_read_rejects_truncated_and_non_4d() {
        let dir = tempfile::tempdir().unwrap();

        let truncated = dir.path().join("short.npy");
        write_array(&truncated, &Array4::<f32>::zeros((1, 2, 2, 1)));
        let mut bytes = std::fs::read(&truncated).unwrap();
        bytes.truncate(bytes.len() - 8);
        std::fs::write(&truncated, bytes).unwrap();
        assert!(matches!(read_volume(&truncated), Err(UNetError::Npy { .. })));

        let flat = dir.path().join("flat.npy");
        Array1::<f32>::zeros(2).write_npy(File::create(&flat).unwrap()).unwrap();
        assert!(matches!(read_volume(&flat), Err(UNetError::Npy { .. })));
    }

    #[test]
    fn test_huge_declared_shape_is_an_error() {
        let dict = "{'descr': '<f4', 'fortran_order': False, \
                    'shape': (4611686018427387904, 1, 1, 1), }";
        let mut header = format!("{}\n", dict);
        while (10 + header.len()) % 64 != 0 {
            header.insert(header.len() - 1, ' ');
        }
        let mut bytes = b"\x93NUMPY\x01\x00".to_vec();
        bytes.extend_from_slice(&(header.len() as u16).to_le_bytes());
        bytes.extend_from_slice(header.as_bytes());
        bytes.extend_from_slice(&[0; 16]);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("huge.npy");
        std::fs::write(&path, bytes).unwrap();
        assert!(matches!(read_volume(&path), Err(UNetError::Npy { .. })));
    }

    #[test]
    fn test_write_then_read_predictions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("msks_pred.npy");
        let vol = Volume::new([2, 2, 2, 1], vec![0.0, 0.25, 0.5, 0.75, 1.0, 0.1, 0.2, 0.3])
            .unwrap();

        write_volume(&path, &vol).unwrap();
        assert_eq!(read_volume(&path).unwrap(), vol);
    }

    #[test]
    fn test_missing_file() {
        let err = read_volume(Path::new("/definitely/not/here.npy")).unwrap_err();
        assert!(matches!(err, UNetError::PathNotFound(_)));
    }
}
