use std::io::Cursor;

use rocket::http::{ContentType, Header, Status};
use rocket::serde::json::Json;
use rocket::State;
use rocket::{request::Request, response::{self, Responder, Response}};

use crate::api::hints::ClientHints;
use crate::api::ApiError;
use crate::config::AppConfig;
use crate::images::{
    get_responsive_image_attributes, AspectRatio, CropPolicy, FailoverResolver, Focus, ImageFormat, ImageOptimizer,
    ImageReference, ResolvedImage, ResponsiveAttributes, ResponsiveOptions, TransformSpec,
};

const IMAGE_CACHE_CONTROL: &str = "public, max-age=31536000, immutable";

// The encoding is negotiated from all three, so shared caches must key on them.
const IMAGE_VARY: &str = "Accept, User-Agent, Cookie";

// Responder for image data
pub struct ImageResponse {
    pub data: Vec<u8>,
    pub content_type: String,
    pub from_cache: bool,
}

impl<'r> Responder<'r, 'static> for ImageResponse {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'static> {
        let content_type = ContentType::parse_flexible(&self.content_type).unwrap_or(ContentType::JPEG);
        let etag = format!("\"{:x}\"", md5::compute(&self.data));
        let cache_status = if self.from_cache { "HIT" } else { "MISS" };

        // Check If-None-Match header
        if let Some(if_none_match) = req.headers().get_one("If-None-Match") {
            if if_none_match == etag {
                return Response::build()
                    .status(Status::NotModified)
                    .header(Header::new("ETag", etag))
                    .header(Header::new("Cache-Control", IMAGE_CACHE_CONTROL))
                    .header(Header::new("Vary", IMAGE_VARY))
                    .ok();
            }
        }

        Response::build()
            .header(content_type)
            .header(Header::new("Cache-Control", IMAGE_CACHE_CONTROL))
            .header(Header::new("ETag", etag))
            .header(Header::new("Vary", IMAGE_VARY))
            .header(Header::new("X-Cache", cache_status))
            .sized_body(self.data.len(), Cursor::new(self.data))
            .ok()
    }
}

#[derive(FromForm)]
pub struct TransformQuery {
    pub src: String,
    pub w: Option<u32>,
    pub h: Option<u32>,
    pub q: Option<u8>,
    pub fm: Option<String>,
    pub crop: Option<String>,
    pub focus: Option<String>,
    pub bl: Option<u8>,
    pub ar: Option<String>,
}

fn check_percent(name: &str, value: Option<u8>) -> Result<(), ApiError> {
    match value {
        Some(v) if !(1..=100).contains(&v) => Err(ApiError::InvalidParameter(format!(
            "{} must be 1-100, got {}",
            name, v
        ))),
        _ => Ok(()),
    }
}

fn check_dimension(name: &str, value: Option<u32>, max: u32) -> Result<(), ApiError> {
    match value {
        Some(v) if v > max => Err(ApiError::InvalidParameter(format!(
            "{} must be at most {}, got {}",
            name, max, v
        ))),
        _ => Ok(()),
    }
}

impl TransformQuery {
    fn to_spec(&self, max_dimension: u32) -> Result<TransformSpec, ApiError> {
        check_percent("Quality", self.q)?;
        check_percent("Blur", self.bl)?;
        check_dimension("Width", self.w, max_dimension)?;
        check_dimension("Height", self.h, max_dimension)?;

        Ok(TransformSpec {
            width: self.w,
            height: self.h,
            quality: self.q,
            format: self.fm.as_deref().map(str::parse::<ImageFormat>).transpose()?,
            crop: self.crop.as_deref().map(str::parse::<CropPolicy>).transpose()?,
            focus: self.focus.as_deref().map(str::parse::<Focus>).transpose()?,
            blur: self.bl,
        })
    }

    fn reference(&self) -> Result<ImageReference, ApiError> {
        let aspect_ratio = self.ar.as_deref().map(str::parse::<AspectRatio>).transpose()?;
        Ok(ImageReference::new(self.src.clone()).with_aspect_ratio(aspect_ratio))
    }
}

#[get("/image?<query..>")]
pub async fn optimize_image(
    query: TransformQuery,
    hints: ClientHints,
    optimizer: &State<ImageOptimizer>,
    config: &State<AppConfig>,
) -> Result<ImageResponse, ApiError> {
    let mut spec = query.to_spec(config.max_dimension)?;
    if spec.needs_conversion() {
        spec = spec.resolve_format(hints.best_format());
    }

    log::debug!("Optimizing image {} with params: {:?}", query.src, spec);

    let image = optimizer.optimize(&query.src, &spec).await?;
    Ok(ImageResponse {
        data: image.data,
        content_type: image.content_type,
        from_cache: image.from_cache,
    })
}

#[get("/image/resolve?<query..>")]
pub fn resolve_image(
    query: TransformQuery,
    hints: ClientHints,
    resolver: &State<FailoverResolver>,
    config: &State<AppConfig>,
) -> Result<Json<ResolvedImage>, ApiError> {
    let mut spec = query.to_spec(config.max_dimension)?;
    if spec.format == Some(ImageFormat::Auto) {
        spec = spec.resolve_format(hints.best_format());
    }
    let reference = query.reference()?;
    if let (Some(ratio), Some(width), None) = (reference.aspect_ratio(), spec.width, spec.height) {
        spec = spec.with_height(ratio.height_for(width));
        if spec.crop.is_none() {
            spec = spec.with_crop(CropPolicy::MaintainRatio);
        }
    }
    let resolved = resolver.get_image_with_failover(&reference, &spec)?;
    Ok(Json(resolved))
}

#[derive(FromForm)]
pub struct ResponsiveQuery {
    pub src: String,
    pub widths: String,
    pub sizes: Option<String>,
    pub w: Option<u32>,
    pub h: Option<u32>,
    pub q: Option<u8>,
    pub fm: Option<String>,
    pub ar: Option<String>,
    pub focus: Option<String>,
    pub lqip: Option<bool>,
    pub color: Option<String>,
}

impl ResponsiveQuery {
    fn to_options(&self, max_dimension: u32) -> Result<ResponsiveOptions, ApiError> {
        check_percent("Quality", self.q)?;
        check_dimension("Width", self.w, max_dimension)?;
        check_dimension("Height", self.h, max_dimension)?;

        let widths = self
            .widths
            .split(',')
            .map(str::trim)
            .filter(|w| !w.is_empty())
            .map(|w| {
                w.parse::<u32>()
                    .map_err(|_| ApiError::InvalidParameter(format!("Invalid width: {}", w)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        for width in &widths {
            check_dimension("Width", Some(*width), max_dimension)?;
        }

        Ok(ResponsiveOptions {
            src: self.src.clone(),
            widths,
            sizes: self.sizes.clone(),
            base_width: self.w,
            base_height: self.h,
            quality: self.q,
            format: self.fm.as_deref().map(str::parse::<ImageFormat>).transpose()?,
            aspect_ratio: self.ar.as_deref().map(str::parse::<AspectRatio>).transpose()?,
            focus: self.focus.as_deref().map(str::parse::<Focus>).transpose()?,
            lqip: self.lqip.unwrap_or(false),
            placeholder_color: self.color.clone(),
        })
    }
}

#[get("/image/responsive?<query..>")]
pub fn responsive_image(
    query: ResponsiveQuery,
    hints: ClientHints,
    resolver: &State<FailoverResolver>,
    config: &State<AppConfig>,
) -> Result<Json<ResponsiveAttributes>, ApiError> {
    let options = query.to_options(config.max_dimension)?;
    let negotiated = match options.format {
        None | Some(ImageFormat::Auto) => Some(hints.best_format()),
        Some(_) => None,
    };
    Ok(Json(get_responsive_image_attributes(resolver, &options, negotiated)))
}
