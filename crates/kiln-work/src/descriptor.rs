use std::{collections::BTreeMap, fmt, sync::Arc};

use camino::{Utf8Path, Utf8PathBuf};
use kiln_engine::NodeDefinitionInfo;
use kiln_snapshot::InputProperty;
use kiln_types::{NodeId, NodeKind, ResourceClaim};

use crate::WorkAction;

/// Everything the engine and the executor need to know about one node.
///
/// Relative input paths are resolved against `root`. Relative output paths
/// are resolved against `root` for tasks and against the workspace for
/// transforms.
#[derive(Clone)]
pub struct NodeDescriptor {
    pub id: NodeId,
    pub kind: NodeKind,
    pub root: Utf8PathBuf,
    pub inputs: BTreeMap<String, InputProperty>,
    pub outputs: BTreeMap<String, Vec<Utf8PathBuf>>,
    pub cacheable: bool,
    pub resources: Vec<ResourceClaim>,
    pub implementation: String,
    pub action: Arc<dyn WorkAction>,
}

impl NodeDescriptor {
    pub fn task(
        id: impl Into<NodeId>,
        root: impl Into<Utf8PathBuf>,
        action: impl WorkAction + 'static,
    ) -> Self {
        Self::new(id.into(), NodeKind::Task, root.into(), Arc::new(action))
    }

    pub fn transform(
        id: impl Into<NodeId>,
        root: impl Into<Utf8PathBuf>,
        action: impl WorkAction + 'static,
    ) -> Self {
        Self::new(id.into(), NodeKind::Transform, root.into(), Arc::new(action))
    }

    fn new(id: NodeId, kind: NodeKind, root: Utf8PathBuf, action: Arc<dyn WorkAction>) -> Self {
        Self {
            id,
            kind,
            root,
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            cacheable: false,
            resources: Vec::new(),
            implementation: action.implementation(),
            action,
        }
    }

    pub fn input(mut self, property: impl Into<String>, input: InputProperty) -> Self {
        self.inputs.insert(property.into(), input);
        self
    }

    pub fn output(
        mut self,
        property: impl Into<String>,
        paths: impl IntoIterator<Item = impl Into<Utf8PathBuf>>,
    ) -> Self {
        self.outputs
            .insert(property.into(), paths.into_iter().map(Into::into).collect());
        self
    }

    pub fn cacheable(mut self, cacheable: bool) -> Self {
        self.cacheable = cacheable;
        self
    }

    pub fn resource(mut self, claim: ResourceClaim) -> Self {
        self.resources.push(claim);
        self
    }

    pub fn implementation(mut self, implementation: impl Into<String>) -> Self {
        self.implementation = implementation.into();
        self
    }

    pub(crate) fn resolved_inputs(&self) -> BTreeMap<String, InputProperty> {
        self.inputs
            .iter()
            .map(|(property, input)| {
                let paths = input
                    .paths
                    .iter()
                    .map(|path| resolve(&self.root, path))
                    .collect::<Vec<_>>();
                (property.clone(), InputProperty::new(paths, input.strategy))
            })
            .collect()
    }

    pub(crate) fn resolved_outputs(&self, base: &Utf8Path) -> BTreeMap<String, Vec<Utf8PathBuf>> {
        self.outputs
            .iter()
            .map(|(property, paths)| {
                (
                    property.clone(),
                    paths.iter().map(|path| resolve(base, path)).collect(),
                )
            })
            .collect()
    }
}

fn resolve(base: &Utf8Path, path: &Utf8Path) -> Utf8PathBuf {
    if path.is_absolute() {
        path.to_owned()
    } else {
        base.join(path)
    }
}

impl NodeDefinitionInfo for NodeDescriptor {
    fn kind(&self) -> NodeKind {
        self.kind
    }

    fn resources(&self) -> &[ResourceClaim] {
        &self.resources
    }
}

impl fmt::Debug for NodeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeDescriptor")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("root", &self.root)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .field("cacheable", &self.cacheable)
            .field("resources", &self.resources)
            .field("implementation", &self.implementation)
            .finish_non_exhaustive()
    }
}
