//! Cache keys for generated media assets

use crate::error::{MediaCacheError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// What kind of media a key points at
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    #[default]
    Image,
    VideoThumbnail,
    MaskPreview,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::VideoThumbnail => "video_thumbnail",
            MediaKind::MaskPreview => "mask_preview",
        }
    }
}

impl FromStr for MediaKind {
    type Err = MediaCacheError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "image" => Ok(MediaKind::Image),
            "video_thumbnail" => Ok(MediaKind::VideoThumbnail),
            "mask_preview" => Ok(MediaKind::MaskPreview),
            other => Err(MediaCacheError::InvalidKey(format!(
                "unknown media kind: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Storage area on the generation server (`type` query parameter of `/view`)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetType {
    #[default]
    Output,
    Input,
    Temp,
}

impl AssetType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssetType::Output => "output",
            AssetType::Input => "input",
            AssetType::Temp => "temp",
        }
    }
}

impl FromStr for AssetType {
    type Err = MediaCacheError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "output" => Ok(AssetType::Output),
            "input" => Ok(AssetType::Input),
            "temp" => Ok(AssetType::Temp),
            other => Err(MediaCacheError::InvalidKey(format!(
                "unknown asset type: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for AssetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one cacheable media asset.
///
/// Keys are plain values: two keys are equal iff every field matches. The
/// canonical string form (see [`CacheKey::as_canonical`]) is stable and safe
/// to use as a keyed-state identifier in the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    #[serde(default)]
    job: String,
    #[serde(default)]
    subfolder: String,
    filename: String,
    #[serde(default, rename = "type")]
    asset_type: AssetType,
    #[serde(default)]
    kind: MediaKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    variant: Option<String>,
}

impl CacheKey {
    /// Create a key for an output image with no job context or variant
    pub fn new(subfolder: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            job: String::new(),
            subfolder: subfolder.into(),
            filename: filename.into(),
            asset_type: AssetType::default(),
            kind: MediaKind::default(),
            variant: None,
        }
    }

    pub fn with_job(mut self, job: impl Into<String>) -> Self {
        self.job = job.into();
        self
    }

    pub fn with_asset_type(mut self, asset_type: AssetType) -> Self {
        self.asset_type = asset_type;
        self
    }

    pub fn with_kind(mut self, kind: MediaKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        self.variant = Some(variant.into());
        self
    }

    pub fn job(&self) -> &str {
        &self.job
    }

    pub fn subfolder(&self) -> &str {
        &self.subfolder
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn asset_type(&self) -> AssetType {
        self.asset_type
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn variant(&self) -> Option<&str> {
        self.variant.as_deref()
    }

    /// Canonical string form: `kind:type:job/subfolder/filename[#variant]`.
    ///
    /// Path components are percent-encoded, so `/`, `:` and `#` inside a
    /// component never collide with the separators.
    pub fn as_canonical(&self) -> String {
        let mut out = format!(
            "{}:{}:{}/{}/{}",
            self.kind,
            self.asset_type,
            urlencoding::encode(&self.job),
            urlencoding::encode(&self.subfolder),
            urlencoding::encode(&self.filename)
        );
        if let Some(variant) = &self.variant {
            out.push('#');
            out.push_str(&urlencoding::encode(variant));
        }
        out
    }

    /// Parse a key from its canonical string form
    pub fn parse(s: &str) -> Result<Self> {
        let invalid = |msg: &str| MediaCacheError::InvalidKey(format!("{}: {}", msg, s));

        let mut head = s.splitn(3, ':');
        let kind = head.next().ok_or_else(|| invalid("missing kind"))?;
        let asset_type = head.next().ok_or_else(|| invalid("missing type"))?;
        let rest = head.next().ok_or_else(|| invalid("missing path"))?;

        let (path, variant) = match rest.split_once('#') {
            Some((path, variant)) => (path, Some(decode(variant, s)?)),
            None => (rest, None),
        };

        let parts: Vec<&str> = path.split('/').collect();
        let [job, subfolder, filename] = parts.as_slice() else {
            return Err(invalid("expected job/subfolder/filename"));
        };

        let filename = decode(filename, s)?;
        if filename.is_empty() {
            return Err(invalid("empty filename"));
        }

        Ok(Self {
            job: decode(job, s)?,
            subfolder: decode(subfolder, s)?,
            filename,
            asset_type: asset_type.parse()?,
            kind: kind.parse()?,
            variant,
        })
    }
}

fn decode(component: &str, whole: &str) -> Result<String> {
    urlencoding::decode(component)
        .map(|c| c.into_owned())
        .map_err(|e| MediaCacheError::InvalidKey(format!("{}: {}", e, whole)))
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_canonical())
    }
}

impl FromStr for CacheKey {
    type Err = MediaCacheError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
