use crate::error::IngestError;
use lopdf::Document;
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use tracing::debug;

pub type RenderedPage = Result<PathBuf, IngestError>;

pub fn page_file_name(page_number: usize) -> String {
    format!("page-{page_number:04}.png")
}

pub trait PageRasterizer: Send + Sync {
    /// Renders every page, in page order, as a PNG under `workspace`. Only a
    /// document that cannot be opened fails the whole call.
    fn render_pages(&self, path: &Path, workspace: &Path) -> Result<Vec<RenderedPage>, IngestError>;
}

#[derive(Debug, Clone)]
pub struct PdfiumRasterizer {
    library_path: Option<PathBuf>,
    max_pixels: u32,
}

impl PdfiumRasterizer {
    pub fn new(library_path: Option<PathBuf>, max_pixels: u32) -> Self {
        Self {
            library_path,
            max_pixels: max_pixels.max(1),
        }
    }

    fn bind(&self) -> Result<Pdfium, IngestError> {
        let bindings = match &self.library_path {
            Some(path) => Pdfium::bind_to_library(path),
            None => Pdfium::bind_to_system_library(),
        }
        .map_err(|error| {
            IngestError::PdfParse(format!("failed to bind to pdfium library: {error}"))
        })?;
        Ok(Pdfium::new(bindings))
    }
}

impl PageRasterizer for PdfiumRasterizer {
    fn render_pages(&self, path: &Path, workspace: &Path) -> Result<Vec<RenderedPage>, IngestError> {
        let pdfium = self.bind()?;
        let document = pdfium
            .load_pdf_from_file(path, None)
            .map_err(|error| IngestError::PdfParse(format!("{}: {error:?}", path.display())))?;

        let render_config = PdfRenderConfig::new()
            .set_target_width(self.max_pixels as i32)
            .set_maximum_height(self.max_pixels as i32);

        let pages = document.pages();
        let total_pages = pages.len() as usize;
        debug!(total_pages, path = %path.display(), "Loaded PDF for rendering");

        Ok((0..total_pages)
            .map(|index| render_page(pages, index, &render_config, workspace))
            .collect())
    }
}

fn render_page(
    pages: &PdfPages<'_>,
    index: usize,
    render_config: &PdfRenderConfig,
    workspace: &Path,
) -> RenderedPage {
    let page_number = index + 1;
    let page = pages
        .get(index as u16)
        .map_err(|error| IngestError::Rasterize {
            page: page_number,
            details: format!("{error:?}"),
        })?;
    let bitmap = page
        .render_with_config(render_config)
        .map_err(|error| IngestError::Rasterize {
            page: page_number,
            details: format!("{error:?}"),
        })?;

    let image = bitmap.as_image();
    debug!(
        page = page_number,
        width = image.width(),
        height = image.height(),
        "Rendered page"
    );

    let target = workspace.join(page_file_name(page_number));
    image
        .save_with_format(&target, image::ImageFormat::Png)
        .map_err(|error| IngestError::Rasterize {
            page: page_number,
            details: error.to_string(),
        })?;
    Ok(target)
}

pub fn read_text_layer(path: &Path) -> Result<Vec<String>, IngestError> {
    let document =
        Document::load(path).map_err(|error| IngestError::PdfParse(error.to_string()))?;

    let mut pages = Vec::new();
    for (page_no, _page_id) in document.get_pages() {
        let text = document.extract_text(&[page_no]).unwrap_or_default();
        pages.push(text.trim().to_string());
    }

    Ok(pages)
}
