//! Manifest rendering and the render-and-apply stage.
//!
//! `TemplateRenderer` turns the YAML templates shipped with the operator into
//! objects for one hub. `apply_rendered` pushes them to the cluster in order,
//! stopping at the first failure.

use crate::crd::MultiClusterHub;
use crate::domain::ports::{ClusterClient, RenderContext, Renderer};
use crate::error::{Error, Result};
use kube::api::DynamicObject;
use kube::ResourceExt;
use serde::Deserialize;
use serde_yaml::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

use super::pipeline::StepOutcome;
use super::resources::attach_owner;

// =============================================================================
// Template Renderer
// =============================================================================

/// A template file parsed into its YAML documents
#[derive(Debug, Clone)]
struct Template {
    path: PathBuf,
    documents: Vec<Value>,
}

impl Template {
    fn parse(path: PathBuf, text: &str) -> Result<Self> {
        let mut documents = Vec::new();
        for doc in serde_yaml::Deserializer::from_str(text) {
            let value = Value::deserialize(doc)?;
            if !value.is_null() {
                documents.push(value);
            }
        }
        Ok(Self { path, documents })
    }
}

/// Renders `*.yaml` templates with hub values substituted for placeholders.
///
/// Placeholders are only expanded inside string scalars of the parsed
/// documents, so a value can never change the structure of a manifest.
#[derive(Debug, Clone)]
pub struct TemplateRenderer {
    templates: Vec<Template>,
}

impl TemplateRenderer {
    /// Load and parse every `*.yaml` file in `dir`, in lexical order
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(Error::Configuration(format!(
                "template directory {} does not exist",
                dir.display()
            )));
        }

        let pattern = dir.join("*.yaml");
        let pattern = pattern
            .to_str()
            .ok_or_else(|| Error::Configuration(format!("non UTF-8 path {}", dir.display())))?;

        let mut paths = glob::glob(pattern)
            .map_err(|e| Error::Configuration(format!("invalid template pattern: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Io(e.into_error()))?;
        paths.sort();

        let templates = paths
            .into_iter()
            .map(|path| {
                let text = std::fs::read_to_string(&path)?;
                Template::parse(path, &text)
            })
            .collect::<Result<Vec<_>>>()?;

        info!(dir = %dir.display(), count = templates.len(), "Loaded manifest templates");
        Ok(Self { templates })
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

/// Placeholder values for one hub
fn substitutions(hub: &MultiClusterHub, ctx: &RenderContext) -> Vec<(&'static str, String)> {
    let spec = &hub.spec;
    vec![
        ("{{NAMESPACE}}", hub.namespace().unwrap_or_default()),
        ("{{HUB_NAME}}", hub.name_any()),
        ("{{VERSION}}", spec.version.clone()),
        ("{{IMAGE_REPO}}", spec.image_repository.clone()),
        ("{{PULL_POLICY}}", spec.image_pull_policy.clone()),
        ("{{MONGO_STORAGE}}", spec.mongo.storage.clone()),
        ("{{MONGO_STORAGE_CLASS}}", spec.mongo.storage_class.clone()),
        ("{{ETCD_STORAGE}}", spec.etcd.storage.clone()),
        ("{{ETCD_STORAGE_CLASS}}", spec.etcd.storage_class.clone()),
        (
            "{{INGRESS_DOMAIN}}",
            ctx.ingress_domain.clone().unwrap_or_default(),
        ),
    ]
}

/// Expand the placeholders of one string in a single left-to-right scan.
/// Substituted text is never scanned again.
fn substitute_str(text: &str, values: &[(&'static str, String)], source: &Path) -> Result<String> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        let end = tail.find("}}").map(|e| e + 2).unwrap_or(tail.len());
        let placeholder = &tail[..end];
        let value = values
            .iter()
            .find(|(p, _)| *p == placeholder)
            .map(|(_, v)| v)
            .ok_or_else(|| {
                Error::Template(format!(
                    "unknown placeholder {} in {}",
                    placeholder,
                    source.display()
                ))
            })?;
        out.push_str(value);
        rest = &tail[end..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Substitute into every string scalar of a parsed document
fn substitute(value: &mut Value, values: &[(&'static str, String)], source: &Path) -> Result<()> {
    match value {
        Value::String(text) => *text = substitute_str(text, values, source)?,
        Value::Sequence(items) => {
            for item in items {
                substitute(item, values, source)?;
            }
        }
        Value::Mapping(map) => {
            for (mut key, mut item) in std::mem::take(map) {
                // `key: {{X}}` parses as a flow mapping used as a key
                if key.is_mapping() {
                    return Err(Error::Template(format!(
                        "unquoted placeholder in {}",
                        source.display()
                    )));
                }
                substitute(&mut key, values, source)?;
                substitute(&mut item, values, source)?;
                map.insert(key, item);
            }
        }
        Value::Tagged(tagged) => substitute(&mut tagged.value, values, source)?,
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
    Ok(())
}

/// Turn a substituted document into an object, requiring type and name
fn to_object(value: Value, source: &Path) -> Result<DynamicObject> {
    let obj: DynamicObject = serde_yaml::from_value(value)?;
    if obj.types.is_none() {
        return Err(Error::Template(format!(
            "manifest in {} has no apiVersion/kind",
            source.display()
        )));
    }
    if obj.metadata.name.is_none() {
        return Err(Error::Template(format!(
            "manifest in {} has no metadata.name",
            source.display()
        )));
    }
    Ok(obj)
}

impl Renderer for TemplateRenderer {
    fn render(&self, hub: &MultiClusterHub, ctx: &RenderContext) -> Result<Vec<DynamicObject>> {
        let values = substitutions(hub, ctx);
        let mut objects = Vec::new();
        for template in &self.templates {
            for document in &template.documents {
                let mut document = document.clone();
                substitute(&mut document, &values, &template.path)?;
                objects.push(to_object(document, &template.path)?);
            }
        }
        debug!(hub = %hub.name_any(), count = objects.len(), "Rendered manifests");
        Ok(objects)
    }
}

// =============================================================================
// Apply Stage
// =============================================================================

/// Apply rendered objects in order.
///
/// Objects in the hub's namespace get the hub as controller owner; failing to
/// set it is logged only. The first apply failure stops the stage and objects
/// applied before it stay in place.
pub async fn apply_rendered(
    client: &dyn ClusterClient,
    hub: &MultiClusterHub,
    objects: Vec<DynamicObject>,
) -> Result<StepOutcome> {
    let hub_namespace = hub.namespace();

    for mut obj in objects {
        if obj.metadata.namespace.is_some() && obj.metadata.namespace == hub_namespace {
            attach_owner(hub, &mut obj.metadata);
        }

        let kind = obj
            .types
            .as_ref()
            .map(|t| t.kind.as_str())
            .unwrap_or("<unknown>")
            .to_string();
        if let Err(e) = client.apply(&obj).await {
            error!(kind = %kind, name = %obj.name_any(), error = %e, "Failed to apply manifest");
            return Err(e);
        }
        debug!(kind = %kind, name = %obj.name_any(), "Applied manifest");
    }

    Ok(StepOutcome::Continue)
}
