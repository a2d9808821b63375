use sha2::{Digest, Sha256};

use crate::error::{ImageRole, PipelineError};
use crate::normalize::NormalizedImage;

pub const EDIT_INSTRUCTION: &str = "Photo editing task: Install the smart lock from image 2 onto \
the door in image 1. Position it where the current handle is, matching the door's perspective, \
lighting and scale. Keep the door's original texture. Output ONLY the resulting JPEG image.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestPart {
    InlineImage { mime_type: String, data: Vec<u8> },
    Text(String),
}

impl RequestPart {
    pub fn is_image(&self) -> bool {
        matches!(self, Self::InlineImage { .. })
    }
}

/// Door image, lock reference image, then the edit instruction. Built fresh per generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    parts: Vec<RequestPart>,
}

impl GenerationRequest {
    pub fn parts(&self) -> &[RequestPart] {
        &self.parts
    }

    pub fn image_parts(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.parts.iter().filter_map(|part| match part {
            RequestPart::InlineImage { mime_type, data } => {
                Some((mime_type.as_str(), data.as_slice()))
            }
            RequestPart::Text(_) => None,
        })
    }

    pub fn instruction(&self) -> Option<&str> {
        self.parts.iter().find_map(|part| match part {
            RequestPart::Text(text) => Some(text.as_str()),
            RequestPart::InlineImage { .. } => None,
        })
    }

    pub fn payload_bytes(&self) -> usize {
        self.image_parts().map(|(_, data)| data.len()).sum()
    }

    /// Stable hex SHA-256 over every part, used to correlate attempts in the event log.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for part in &self.parts {
            match part {
                RequestPart::InlineImage { mime_type, data } => {
                    hasher.update(b"image\0");
                    hasher.update(mime_type.as_bytes());
                    hasher.update((data.len() as u64).to_be_bytes());
                    hasher.update(data);
                }
                RequestPart::Text(text) => {
                    hasher.update(b"text\0");
                    hasher.update(text.as_bytes());
                }
            }
        }
        hex::encode(hasher.finalize())
    }
}

pub fn build(
    door: &NormalizedImage,
    lock: &NormalizedImage,
) -> Result<GenerationRequest, PipelineError> {
    if door.is_empty() {
        return Err(PipelineError::EmptyPayload {
            role: ImageRole::Door,
        });
    }
    if lock.is_empty() {
        return Err(PipelineError::EmptyPayload {
            role: ImageRole::Lock,
        });
    }
    Ok(GenerationRequest {
        parts: vec![
            image_part(door),
            image_part(lock),
            RequestPart::Text(EDIT_INSTRUCTION.to_string()),
        ],
    })
}

fn image_part(image: &NormalizedImage) -> RequestPart {
    RequestPart::InlineImage {
        mime_type: image.mime_type.clone(),
        data: image.data.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::{build, RequestPart, EDIT_INSTRUCTION};
    use crate::error::{ImageRole, PipelineError};
    use crate::normalize::NormalizedImage;

    fn normalized(data: &[u8]) -> NormalizedImage {
        NormalizedImage {
            data: data.to_vec(),
            mime_type: "image/jpeg".to_string(),
            width: 10,
            height: 10,
            quality: 0.8,
        }
    }

    #[test]
    fn request_has_two_images_then_one_instruction() -> anyhow::Result<()> {
        let request = build(&normalized(b"door"), &normalized(b"lock"))?;
        let parts = request.parts();
        assert_eq!(parts.iter().filter(|part| part.is_image()).count(), 2);
        assert_eq!(parts.iter().filter(|part| !part.is_image()).count(), 1);
        assert_eq!(
            parts[0],
            RequestPart::InlineImage {
                mime_type: "image/jpeg".to_string(),
                data: b"door".to_vec(),
            }
        );
        assert!(matches!(&parts[1], RequestPart::InlineImage { data, .. } if data == b"lock"));
        assert_eq!(request.instruction(), Some(EDIT_INSTRUCTION));
        assert_eq!(request.payload_bytes(), 8);
        Ok(())
    }

    #[test]
    fn empty_payloads_are_rejected_by_role() {
        assert_eq!(
            build(&normalized(b""), &normalized(b"lock")),
            Err(PipelineError::EmptyPayload {
                role: ImageRole::Door
            })
        );
        assert_eq!(
            build(&normalized(b"door"), &normalized(b"")),
            Err(PipelineError::EmptyPayload {
                role: ImageRole::Lock
            })
        );
    }

    #[test]
    fn digest_tracks_part_order() -> anyhow::Result<()> {
        let forward = build(&normalized(b"a"), &normalized(b"b"))?;
        let again = build(&normalized(b"a"), &normalized(b"b"))?;
        let swapped = build(&normalized(b"b"), &normalized(b"a"))?;
        assert_eq!(forward.digest(), again.digest());
        assert_ne!(forward.digest(), swapped.digest());
        assert_eq!(forward.digest().len(), 64);
        Ok(())
    }
}
