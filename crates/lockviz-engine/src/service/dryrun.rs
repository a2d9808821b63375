use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};

use super::{GenerationResponse, GenerationService, ResponsePart, ServiceError};
use crate::request::GenerationRequest;

const PROVIDER: &str = "dryrun";
const OUTPUT_QUALITY: u8 = 90;

/// Offline stand-in for the remote model: pastes the lock image onto the right-middle of the
/// door, a quarter of the door's width wide.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryrunService;

impl GenerationService for DryrunService {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationResponse, ServiceError> {
        let mut images = request.image_parts().map(|(_, data)| data.to_vec());
        let (Some(door), Some(lock)) = (images.next(), images.next()) else {
            return Err(invalid_request("expected a door image and a lock image"));
        };
        let composed = tokio::task::spawn_blocking(move || composite(&door, &lock))
            .await
            .map_err(|err| invalid_request(format!("compositor task failed: {err}")))??;
        Ok(GenerationResponse::new(vec![
            ResponsePart::Text("dryrun composite".to_string()),
            ResponsePart::InlineImage {
                mime_type: "image/jpeg".to_string(),
                data: composed,
            },
        ]))
    }
}

fn composite(door: &[u8], lock: &[u8]) -> Result<Vec<u8>, ServiceError> {
    let mut canvas = image::load_from_memory(door)
        .map_err(|err| invalid_request(format!("door image: {err}")))?
        .to_rgba8();
    let lock = image::load_from_memory(lock)
        .map_err(|err| invalid_request(format!("lock image: {err}")))?;

    let (door_width, door_height) = canvas.dimensions();
    let lock_width = (door_width / 4).max(1);
    let lock_height = ((f64::from(lock.height()) * f64::from(lock_width)
        / f64::from(lock.width().max(1)))
    .round() as u32)
        .clamp(1, door_height.max(1));
    let badge = imageops::resize(&lock.to_rgba8(), lock_width, lock_height, FilterType::Triangle);
    let x = door_width.saturating_sub(lock_width + door_width / 10);
    let y = door_height.saturating_sub(lock_height) / 2;
    imageops::overlay(&mut canvas, &badge, i64::from(x), i64::from(y));

    let rgb = image::DynamicImage::ImageRgba8(canvas).to_rgb8();
    let mut bytes = Vec::new();
    JpegEncoder::new_with_quality(&mut bytes, OUTPUT_QUALITY)
        .encode_image(&rgb)
        .map_err(|err| invalid_request(format!("jpeg encode failed: {err}")))?;
    Ok(bytes)
}

fn invalid_request(message: impl Into<String>) -> ServiceError {
    ServiceError::InvalidRequest {
        provider: PROVIDER.to_string(),
        message: message.into(),
    }
}
