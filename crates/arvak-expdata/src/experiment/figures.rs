//! Figures.

use std::path::Path;

use tracing::{debug, warn};

use super::ExperimentData;
use crate::error::{ExpDataError, ExpDataResult};
use crate::figure::{Figure, FigureInput, FigureKey, generated_name, normalize_name};
use crate::service::{Entry, ServiceError, upsert};

impl ExperimentData {
    /// Add figures.
    ///
    /// `names` must match `figures` in length if given. Unnamed figures are
    /// named after their file, or generated from the experiment type and
    /// id. Names get an `.svg` extension if missing. With `save` (default:
    /// the auto-save flag) each figure is uploaded right away.
    pub async fn add_figures(
        &self,
        figures: Vec<FigureInput>,
        names: Option<Vec<String>>,
        overwrite: bool,
        save: Option<bool>,
    ) -> ExpDataResult<Vec<String>> {
        let names: Vec<Option<String>> = match names {
            Some(names) if names.len() != figures.len() => {
                return Err(ExpDataError::InvalidArgument(format!(
                    "{} figure names given for {} figures",
                    names.len(),
                    figures.len()
                )));
            }
            Some(names) => names.into_iter().map(Some).collect(),
            None => vec![None; figures.len()],
        };
        let save = save.unwrap_or_else(|| self.auto_save());
        let mut added = Vec::with_capacity(figures.len());

        for (input, name) in figures.into_iter().zip(names) {
            let (implied, figure) = input.resolve().await?;
            let (name, existing) = {
                let mut stored = self.figures.lock();
                let name = name.or(implied).map(normalize_name).unwrap_or_else(|| {
                    generated_name(&self.experiment_type, stored.len(), &self.id)
                });
                let existing = stored.contains_key(&name);
                if existing && !overwrite {
                    return Err(ExpDataError::AlreadyExists(format!(
                        "figure {name} already exists; use overwrite to replace it"
                    )));
                }
                stored.insert(name.clone(), Some(figure.clone()));
                (name, existing)
            };
            self.deleted_figures.lock().retain(|queued| queued != &name);
            debug!(experiment_id = %self.id, figure = %name, "Added figure");

            if save {
                self.upload_figure(&name, &figure, !existing).await;
            }
            added.push(name);
        }

        self.after_mutation().await;
        Ok(added)
    }

    /// Add one figure without saving it immediately.
    pub async fn add_figure(
        &self,
        figure: impl Into<FigureInput>,
        name: Option<&str>,
        overwrite: bool,
    ) -> ExpDataResult<String> {
        let names = name.map(|n| vec![n.to_string()]);
        let mut added = self
            .add_figures(vec![figure.into()], names, overwrite, Some(false))
            .await?;
        added
            .pop()
            .ok_or_else(|| ExpDataError::InvalidArgument("no figure added".to_string()))
    }

    /// Upload one figure; failures are logged.
    pub(crate) async fn upload_figure(&self, name: &str, figure: &Figure, is_new: bool) -> bool {
        let Some(service) = self.service() else {
            return false;
        };
        let bytes = match figure.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(
                    experiment_id = %self.id,
                    figure = %name,
                    error = %e,
                    "Unable to render figure"
                );
                return false;
            }
        };
        let entry = Entry::Figure {
            experiment_id: &self.id,
            name,
            bytes: &bytes,
        };
        match upsert(service.as_ref(), entry, is_new).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    experiment_id = %self.id,
                    figure = %name,
                    error = %e,
                    "Experiment service operation failed"
                );
                false
            }
        }
    }

    fn resolve_figure_key(&self, key: &FigureKey) -> ExpDataResult<(String, Option<Figure>)> {
        let stored = self.figures.lock();
        let found = match key {
            FigureKey::Index(i) => stored
                .get_index(*i)
                .map(|(name, fig)| (name.clone(), fig.clone())),
            FigureKey::Name(name) => stored.get(name).map(|fig| (name.clone(), fig.clone())),
        };
        found.ok_or_else(|| ExpDataError::NotFound(format!("figure {key}")))
    }

    /// Remove a figure and queue its remote deletion.
    ///
    /// With auto-save the deletion is sent right away; if that fails the
    /// figure stays queued for the next save.
    pub async fn delete_figure(&self, key: impl Into<FigureKey>) -> ExpDataResult<String> {
        let (name, _) = self.resolve_figure_key(&key.into())?;
        self.figures.remove(&name);
        self.deleted_figures.push(name.clone());
        debug!(experiment_id = %self.id, figure = %name, "Deleted figure");

        if self.auto_save() {
            if let Some(service) = self.service() {
                match service.delete_figure(&self.id, &name).await {
                    Ok(()) | Err(ServiceError::NotFound(_)) => {
                        self.deleted_figures.lock().retain(|queued| queued != &name);
                    }
                    Err(e) => {
                        warn!(
                            experiment_id = %self.id,
                            figure = %name,
                            error = %e,
                            "Experiment service operation failed"
                        );
                    }
                }
            }
        }
        self.after_mutation().await;
        Ok(name)
    }

    /// A figure by name or position.
    ///
    /// Figures known only by name are downloaded from the service and
    /// cached.
    pub async fn figure(&self, key: impl Into<FigureKey>) -> ExpDataResult<Figure> {
        let (name, stored) = self.resolve_figure_key(&key.into())?;
        if let Some(figure) = stored {
            return Ok(figure);
        }
        let service = self.service().ok_or_else(|| {
            ExpDataError::NotFound(format!(
                "figure {name} is not loaded and no experiment service is set"
            ))
        })?;
        let figure = Figure::image(service.figure(&self.id, &name).await?);
        self.figures.update(&name, |slot| {
            if slot.is_none() {
                *slot = Some(figure.clone());
            }
        });
        Ok(figure)
    }

    /// Write a figure's image bytes to `path`. Returns the number of bytes
    /// written.
    pub async fn write_figure(
        &self,
        key: impl Into<FigureKey>,
        path: impl AsRef<Path>,
    ) -> ExpDataResult<usize> {
        let bytes = self.figure(key).await?.to_bytes()?;
        tokio::fs::write(path, &bytes).await?;
        Ok(bytes.len())
    }
}
