//! Layer width resolution through temporary forward hooks
//!
//! Given a host model and a list of dotted submodule names, [`resolve_widths`]
//! runs the host's dummy input through one forward pass and records how wide
//! each named submodule's output is along an axis. Hooks are registered under
//! a [`HookGuard`], so they are removed whether the forward pass succeeds,
//! returns an error, or panics.
//!
//! Hosts implement [`HookableModel`]. Most hosts embed a [`HookRegistry`]
//! and call [`HookRegistry::fire`] after each submodule computes its output.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use candle_core::{Device, Tensor};
use tracing::debug;

use crate::error::{Result, SaeError};

/// Output of a submodule as seen by a hook.
#[derive(Debug, Clone)]
pub enum ModuleOutput {
    Tensor(Tensor),
    /// Composite output, e.g. `(hidden, attention_weights)`.
    Tuple(Vec<Tensor>),
}

impl ModuleOutput {
    /// The tensor a hook should inspect: the tensor itself, or a tuple's first element.
    pub fn primary(&self) -> Option<&Tensor> {
        match self {
            Self::Tensor(t) => Some(t),
            Self::Tuple(items) => items.first(),
        }
    }
}

/// Callback run after a submodule's forward. An error aborts the forward pass.
pub type ForwardHook = Box<dyn Fn(&ModuleOutput) -> Result<()> + Send + Sync>;

/// Token returned by registration, used to remove the hook again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookHandle(u64);

/// What a host model must expose for width resolution.
pub trait HookableModel {
    /// Whether `name` (dotted path, e.g. `"layers.3.mlp"`) is a submodule.
    fn has_submodule(&self, name: &str) -> bool;

    /// All dotted submodule names, in definition order.
    fn submodule_names(&self) -> Vec<String>;

    /// Attach `hook` to the output of submodule `name`.
    fn register_forward_hook(&self, name: &str, hook: ForwardHook) -> Result<HookHandle>;

    /// Detach a hook. Returns `false` if it was already gone.
    fn remove_hook(&self, handle: HookHandle) -> bool;

    /// Example input the host declares for probing.
    fn dummy_input(&self) -> Result<Tensor>;

    /// Device the host's weights live on.
    fn device(&self) -> &Device;

    fn forward(&self, input: &Tensor) -> Result<Tensor>;
}

struct RegisteredHook {
    handle: HookHandle,
    module: String,
    hook: Arc<ForwardHook>,
}

/// Interior-mutable hook table a host can embed.
#[derive(Default)]
pub struct HookRegistry {
    hooks: Mutex<Vec<RegisteredHook>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry")
            .field("len", &self.len())
            .finish()
    }
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<RegisteredHook>> {
        // A hook that panicked leaves the table itself consistent
        self.hooks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, module: &str, hook: ForwardHook) -> HookHandle {
        let handle = HookHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push(RegisteredHook {
            handle,
            module: module.to_string(),
            hook: Arc::new(hook),
        });
        handle
    }

    pub fn remove(&self, handle: HookHandle) -> bool {
        let mut hooks = self.lock();
        let before = hooks.len();
        hooks.retain(|h| h.handle != handle);
        hooks.len() != before
    }

    /// Run every hook attached to `module`, in registration order.
    ///
    /// The table lock is released before hooks run, so a hook may register
    /// or remove hooks without deadlocking.
    pub fn fire(&self, module: &str, output: &ModuleOutput) -> Result<()> {
        let matching: Vec<Arc<ForwardHook>> = self
            .lock()
            .iter()
            .filter(|h| h.module == module)
            .map(|h| Arc::clone(&h.hook))
            .collect();
        for hook in matching {
            hook(output)?;
        }
        Ok(())
    }

    /// Number of hooks currently attached.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Removes every hook it holds when dropped.
pub struct HookGuard<'a, M: HookableModel + ?Sized> {
    model: &'a M,
    handles: Vec<HookHandle>,
}

impl<'a, M: HookableModel + ?Sized> HookGuard<'a, M> {
    pub fn new(model: &'a M) -> Self {
        Self {
            model,
            handles: Vec::new(),
        }
    }

    /// Register a hook whose removal this guard now owns.
    pub fn register(&mut self, name: &str, hook: ForwardHook) -> Result<()> {
        let handle = self.model.register_forward_hook(name, hook)?;
        self.handles.push(handle);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl<M: HookableModel + ?Sized> Drop for HookGuard<'_, M> {
    fn drop(&mut self) {
        for handle in self.handles.drain(..) {
            self.model.remove_hook(handle);
        }
    }
}

/// Output width of each named submodule along the last axis.
pub fn resolve_widths<M: HookableModel + ?Sized>(
    model: &M,
    module_names: &[&str],
) -> Result<HashMap<String, usize>> {
    resolve_widths_along(model, module_names, -1)
}

/// Output width of each named submodule along `axis` (negative counts from the end).
///
/// Every name is checked before any hook is attached. Submodules the dummy
/// forward pass never reaches are absent from the result; treat a missing
/// key as unknown, not zero.
pub fn resolve_widths_along<M: HookableModel + ?Sized>(
    model: &M,
    module_names: &[&str],
    axis: isize,
) -> Result<HashMap<String, usize>> {
    let names: BTreeSet<&str> = module_names.iter().copied().collect();
    for name in &names {
        if !model.has_submodule(name) {
            return Err(SaeError::SubmoduleNotFound((*name).to_string()));
        }
    }

    let shapes: Arc<Mutex<HashMap<String, usize>>> = Arc::new(Mutex::new(HashMap::new()));

    {
        let mut guard = HookGuard::new(model);
        for name in &names {
            let module = (*name).to_string();
            let shapes = Arc::clone(&shapes);
            guard.register(
                name,
                Box::new(move |output: &ModuleOutput| {
                    let tensor = output.primary().ok_or_else(|| SaeError::Hook {
                        module: module.clone(),
                        reason: "empty tuple output".to_string(),
                    })?;
                    let dim = normalize_axis(tensor.rank(), axis).ok_or_else(|| {
                        SaeError::Hook {
                            module: module.clone(),
                            reason: format!(
                                "axis {axis} out of range for output of rank {}",
                                tensor.rank()
                            ),
                        }
                    })?;
                    let width = tensor.dim(dim)?;
                    shapes
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(module.clone(), width);
                    Ok(())
                }),
            )?;
        }

        let dummy = model.dummy_input()?.to_device(model.device())?;
        model.forward(&dummy)?;
        // guard drops here and detaches every hook, also on the `?` paths above
    }

    let shapes = shapes.lock().unwrap_or_else(PoisonError::into_inner).clone();

    let unresolved: Vec<&str> = names
        .iter()
        .copied()
        .filter(|n| !shapes.contains_key(*n))
        .collect();
    if !unresolved.is_empty() {
        debug!("Submodules not reached by the dummy forward pass: {unresolved:?}");
    }

    Ok(shapes)
}

/// Find the unique `prefix.0 .. prefix.{n_layers-1}` submodule list.
///
/// Returns the prefix and the layer names in index order. Fails if no
/// list, or more than one, has exactly `n_layers` entries.
pub fn layer_list<M: HookableModel + ?Sized>(
    model: &M,
    n_layers: usize,
) -> Result<(String, Vec<String>)> {
    let mut lists: BTreeMap<String, BTreeSet<usize>> = BTreeMap::new();
    for name in model.submodule_names() {
        if let Some((prefix, last)) = name.rsplit_once('.') {
            if let Ok(index) = last.parse::<usize>() {
                lists.entry(prefix.to_string()).or_default().insert(index);
            }
        }
    }

    let candidates: Vec<(&String, &BTreeSet<usize>)> = lists
        .iter()
        .filter(|(_, indices)| {
            indices.len() == n_layers && indices.iter().copied().eq(0..n_layers)
        })
        .collect();

    match candidates.as_slice() {
        [(prefix, _)] => {
            let names = (0..n_layers).map(|i| format!("{prefix}.{i}")).collect();
            Ok(((*prefix).clone(), names))
        }
        [] => Err(SaeError::LayerList(format!(
            "no submodule list with {n_layers} entries"
        ))),
        many => Err(SaeError::LayerList(format!(
            "{} submodule lists with {n_layers} entries: {:?}",
            many.len(),
            many.iter().map(|(p, _)| p.as_str()).collect::<Vec<_>>()
        ))),
    }
}

fn normalize_axis(rank: usize, axis: isize) -> Option<usize> {
    let rank = isize::try_from(rank).ok()?;
    let dim = if axis < 0 { rank + axis } else { axis };
    if (0..rank).contains(&dim) {
        usize::try_from(dim).ok()
    } else {
        None
    }
}
