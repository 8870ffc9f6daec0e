//! Figures attached to an experiment.
//!
//! A figure is stored either as image bytes or as a renderable plot object.
//! Plots are rendered to SVG only when bytes are needed (upload,
//! serialization, file export).

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use crate::error::{ExpDataError, ExpDataResult};

/// Extension every stored figure name carries.
pub const FIGURE_EXTENSION: &str = ".svg";

/// An in-memory plot that can render itself as SVG.
pub trait RenderFigure: Send + Sync {
    /// Render the plot to SVG bytes.
    fn render_svg(&self) -> anyhow::Result<Vec<u8>>;
}

/// A stored figure.
#[derive(Clone)]
pub enum Figure {
    /// Encoded image bytes.
    Image(Arc<[u8]>),
    /// A plot rendered on demand.
    Plot(Arc<dyn RenderFigure>),
}

impl Figure {
    /// Figure from image bytes.
    pub fn image(bytes: impl Into<Vec<u8>>) -> Self {
        Figure::Image(bytes.into().into())
    }

    /// Image bytes of this figure, rendering plots to SVG.
    pub fn to_bytes(&self) -> ExpDataResult<Arc<[u8]>> {
        match self {
            Figure::Image(bytes) => Ok(bytes.clone()),
            Figure::Plot(plot) => plot
                .render_svg()
                .map(Into::into)
                .map_err(|e| ExpDataError::Render(format!("{e:#}"))),
        }
    }
}

impl fmt::Debug for Figure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Figure::Image(bytes) => write!(f, "Figure::Image({} bytes)", bytes.len()),
            Figure::Plot(_) => f.write_str("Figure::Plot"),
        }
    }
}

/// A figure handed to `add_figures`.
#[derive(Clone)]
pub enum FigureInput {
    /// Read the figure from a file; its file name becomes the default name.
    Path(PathBuf),
    /// Raw image bytes.
    Bytes(Vec<u8>),
    /// A renderable plot.
    Plot(Arc<dyn RenderFigure>),
    /// An existing figure.
    Figure(Figure),
}

impl FigureInput {
    /// Load the figure, returning the name implied by the input, if any.
    pub(crate) async fn resolve(self) -> ExpDataResult<(Option<String>, Figure)> {
        match self {
            FigureInput::Path(path) => {
                let bytes = tokio::fs::read(&path).await?;
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned());
                Ok((name, Figure::image(bytes)))
            }
            FigureInput::Bytes(bytes) => Ok((None, Figure::image(bytes))),
            FigureInput::Plot(plot) => Ok((None, Figure::Plot(plot))),
            FigureInput::Figure(figure) => Ok((None, figure)),
        }
    }
}

impl From<Vec<u8>> for FigureInput {
    fn from(bytes: Vec<u8>) -> Self {
        FigureInput::Bytes(bytes)
    }
}

impl From<PathBuf> for FigureInput {
    fn from(path: PathBuf) -> Self {
        FigureInput::Path(path)
    }
}

impl From<Figure> for FigureInput {
    fn from(figure: Figure) -> Self {
        FigureInput::Figure(figure)
    }
}

impl From<Arc<dyn RenderFigure>> for FigureInput {
    fn from(plot: Arc<dyn RenderFigure>) -> Self {
        FigureInput::Plot(plot)
    }
}

/// Addresses a figure by name or position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FigureKey {
    /// Position in insertion order.
    Index(usize),
    /// Figure name.
    Name(String),
}

impl From<usize> for FigureKey {
    fn from(i: usize) -> Self {
        FigureKey::Index(i)
    }
}

impl From<&str> for FigureKey {
    fn from(name: &str) -> Self {
        FigureKey::Name(name.to_string())
    }
}

impl From<String> for FigureKey {
    fn from(name: String) -> Self {
        FigureKey::Name(name)
    }
}

impl fmt::Display for FigureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FigureKey::Index(i) => write!(f, "#{i}"),
            FigureKey::Name(name) => f.write_str(name),
        }
    }
}

/// Append the figure extension if missing.
pub(crate) fn normalize_name(name: String) -> String {
    if name.ends_with(FIGURE_EXTENSION) {
        return name;
    }
    info!(figure = %name, "Figure name has no SVG extension; appending '{FIGURE_EXTENSION}'");
    name + FIGURE_EXTENSION
}

/// Name given to the `index`-th figure of an experiment when none is supplied.
pub(crate) fn generated_name(experiment_type: &str, index: usize, experiment_id: &str) -> String {
    let short: String = experiment_id.chars().take(8).collect();
    format!("{experiment_type}_Fig-{index}_Exp-{short}{FIGURE_EXTENSION}")
}
