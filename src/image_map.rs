//! Resolves absolute addresses to the loaded image that contains them.
//!
//! Loaded once, from the prefix data file, and immutable afterwards. The
//! image count is expected to stay in the low hundreds, so `find` is a
//! linear scan rather than an interval tree — but interesting images (the
//! ones actually queried on every branch and memory access) are kept first
//! so the common case terminates early.

use std::fs;
use std::path::Path;

use crate::error::{Result, TraceWalkError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub id: u32,
    pub name: String,
    pub start: u64,
    pub end: u64,
    pub interesting: bool,
}

impl Image {
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr <= self.end
    }
}

#[derive(Debug, Clone, Default)]
pub struct ImageMap {
    /// Ordered with interesting images first; `Image::id` is the stable,
    /// load-order identity, independent of this vector's position.
    images: Vec<Image>,
}

impl ImageMap {
    pub fn from_images(mut images: Vec<Image>) -> Self {
        images.sort_by_key(|img| !img.interesting);
        Self { images }
    }

    /// Parses the prefix data file: one image per line, tab-separated
    /// `"i\t{interesting:0|1}\t{start:%016x}\t{end:%016x}\t{path}"`.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| TraceWalkError::io(path, e))?;
        let mut images = Vec::new();
        for (line_no, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let image = parse_image_line(path, line_no + 1, line, images.len() as u32)?;
            images.push(image);
        }
        Ok(Self::from_images(images))
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Resolves an absolute address to `(image_id, relative_offset)`.
    pub fn find(&self, addr: u64) -> Option<(u32, u64)> {
        self.images
            .iter()
            .find(|img| img.contains(addr))
            .map(|img| (img.id, addr - img.start))
    }

    pub fn image_by_id(&self, id: u32) -> Option<&Image> {
        self.images.iter().find(|img| img.id == id)
    }

    /// Images in stable id order, for emitting the preprocessed trace
    /// header.
    pub fn in_id_order(&self) -> Vec<&Image> {
        let mut v: Vec<&Image> = self.images.iter().collect();
        v.sort_by_key(|img| img.id);
        v
    }
}

fn parse_image_line(path: &Path, line_no: usize, line: &str, next_id: u32) -> Result<Image> {
    let malformed = |reason: &str| TraceWalkError::MalformedPrefixData {
        path: path.to_path_buf(),
        line: line_no,
        reason: reason.to_string(),
    };

    let parts: Vec<&str> = line.splitn(5, '\t').collect();
    if parts.len() != 5 {
        return Err(malformed(&format!(
            "expected 5 tab-separated fields, got {}",
            parts.len()
        )));
    }
    if parts[0] != "i" {
        return Err(malformed("expected leading 'i' marker field"));
    }
    let interesting = match parts[1] {
        "0" => false,
        "1" => true,
        other => return Err(malformed(&format!("invalid interesting flag {other:?}"))),
    };
    let start = u64::from_str_radix(parts[2], 16)
        .map_err(|_| malformed(&format!("invalid start address {:?}", parts[2])))?;
    let end = u64::from_str_radix(parts[3], 16)
        .map_err(|_| malformed(&format!("invalid end address {:?}", parts[3])))?;
    Ok(Image {
        id: next_id,
        name: parts[4].to_string(),
        start,
        end,
        interesting,
    })
}
