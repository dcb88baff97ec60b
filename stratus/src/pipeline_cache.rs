// Trait keyed pipeline cache
//
// Pipelines are tied to a render-pass compatibility class, so a render
// pass change (swapchain recreate) flushes the whole cache. A build
// failure retries with the minimal trait set and stores that pipeline
// under the originally requested key so later lookups short-circuit.

use ash::util::read_spv;
use ash::vk;

use crate::backend::Backend;
use crate::pipeline::{Pipeline, PipelineHandles, ShaderTraits};
use crate::{Result, StratusError};
use utils::log;

use std::collections::HashMap;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;

const VERT_SHADER_FILE: &str = "quad.vert.spv";
const FRAG_SHADER_FILE: &str = "scene.frag.spv";

/// Candidate directories for the compiled SPIR-V pair, probed in
/// order; first directory containing both files wins.
fn shader_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    if let Ok(dir) = std::env::var("STRATUS_SHADER_DIR") {
        paths.push(PathBuf::from(dir));
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            paths.push(dir.join("shaders"));
            paths.push(dir.join("../shaders"));
        }
    }

    if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
        paths.push(PathBuf::from(data_home).join("stratus/shaders"));
    }
    if let Ok(data_dirs) = std::env::var("XDG_DATA_DIRS") {
        for dir in data_dirs.split(':') {
            if !dir.is_empty() {
                paths.push(PathBuf::from(dir).join("stratus/shaders"));
            }
        }
    }

    paths.push(PathBuf::from("/usr/share/stratus/shaders"));
    paths.push(PathBuf::from("/usr/local/share/stratus/shaders"));

    paths
}

fn load_spv(path: &PathBuf) -> Result<Vec<u32>> {
    let bytes = std::fs::read(path).or(Err(StratusError::SHADERS_NOT_FOUND))?;
    read_spv(&mut Cursor::new(bytes.as_slice())).or(Err(StratusError::SHADERS_NOT_FOUND))
}

pub struct PipelineCache {
    backend: Arc<Backend>,
    render_pass: vk::RenderPass,

    pipelines: HashMap<ShaderTraits, Pipeline>,
    /// Binding scope stack for scene code; the top is the pipeline
    /// currently considered bound.
    binder_stack: Vec<PipelineHandles>,

    vert_spirv: Vec<u32>,
    frag_spirv: Vec<u32>,
    shaders_loaded: bool,
}

impl PipelineCache {
    pub fn new(backend: Arc<Backend>) -> PipelineCache {
        let mut ret = PipelineCache {
            backend: backend,
            render_pass: vk::RenderPass::null(),
            pipelines: HashMap::new(),
            binder_stack: Vec::new(),
            vert_spirv: Vec::new(),
            frag_spirv: Vec::new(),
            shaders_loaded: false,
        };

        if let Err(e) = ret.load_shaders() {
            log::error!("Could not load SPIR-V shaders: {:?}", e);
        }
        ret
    }

    /// Locate and read the two SPIR-V blobs from the well-known data
    /// directories.
    fn load_shaders(&mut self) -> Result<()> {
        for base in shader_search_paths() {
            let vert = base.join(VERT_SHADER_FILE);
            let frag = base.join(FRAG_SHADER_FILE);

            if vert.exists() && frag.exists() {
                self.vert_spirv = load_spv(&vert)?;
                self.frag_spirv = load_spv(&frag)?;
                self.shaders_loaded = true;
                log::debug!("Found Vulkan shaders in {:?}", base);
                return Ok(());
            }
        }

        Err(StratusError::SHADERS_NOT_FOUND)
    }

    pub fn shaders_loaded(&self) -> bool {
        self.shaders_loaded
    }

    /// Point the cache at a new render pass. Changing the pass flushes
    /// every cached pipeline.
    pub fn set_render_pass(&mut self, render_pass: vk::RenderPass) {
        if self.render_pass != render_pass {
            self.clear();
            self.render_pass = render_pass;
        }
    }

    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    /// Get or create the pipeline for `traits`.
    ///
    /// Returns None when the pipeline cannot be built even with the
    /// fallback trait set; the caller must not draw with it.
    pub fn pipeline(&mut self, traits: ShaderTraits) -> Option<PipelineHandles> {
        if self.render_pass == vk::RenderPass::null() {
            log::error!("Cannot get pipeline: render pass not set");
            return None;
        }
        if !self.shaders_loaded {
            log::error!("Cannot get pipeline: shaders not loaded");
            return None;
        }

        if let Some(pipeline) = self.pipelines.get(&traits) {
            return Some(pipeline.handles());
        }

        let built = Pipeline::new(
            self.backend.clone(),
            self.render_pass,
            traits,
            &self.vert_spirv,
            &self.frag_spirv,
        );

        let pipeline = match built {
            Ok(p) => p,
            Err(_) => {
                // Retry with the minimal trait set, and remember the
                // result under the requested key so later lookups
                // don't retry the broken combination.
                let fallback =
                    traits & (ShaderTraits::MAP_TEXTURE | ShaderTraits::UNIFORM_COLOR);
                if fallback == traits {
                    return None;
                }
                log::debug!(
                    "Pipeline for traits {:?} failed, retrying with {:?}",
                    traits,
                    fallback
                );
                match Pipeline::new(
                    self.backend.clone(),
                    self.render_pass,
                    fallback,
                    &self.vert_spirv,
                    &self.frag_spirv,
                ) {
                    Ok(p) => p,
                    Err(_) => return None,
                }
            }
        };

        let handles = pipeline.handles();
        self.pipelines.insert(traits, pipeline);
        Some(handles)
    }

    /// Push a pipeline onto the binding stack.
    pub fn push_pipeline(&mut self, handles: PipelineHandles) {
        self.binder_stack.push(handles);
    }

    /// Pop the top pipeline from the binding stack.
    pub fn pop_pipeline(&mut self) -> Option<PipelineHandles> {
        self.binder_stack.pop()
    }

    /// The pipeline currently at the top of the binding stack.
    pub fn current_pipeline(&self) -> Option<PipelineHandles> {
        self.binder_stack.last().copied()
    }

    /// Drop every cached pipeline. Required whenever the render pass
    /// changes, and safe only once the device is idle.
    pub fn clear(&mut self) {
        self.pipelines.clear();
        self.binder_stack.clear();
    }
}

/// RAII scope for a pipeline bind: resolves the pipeline for `traits`,
/// pushes it on the cache's binding stack, and pops it again when the
/// scope ends.
pub struct PipelineBinder<'a> {
    cache: &'a mut PipelineCache,
    handles: Option<PipelineHandles>,
}

impl<'a> PipelineBinder<'a> {
    pub fn new(cache: &'a mut PipelineCache, traits: ShaderTraits) -> PipelineBinder<'a> {
        let handles = cache.pipeline(traits);
        if let Some(h) = handles {
            cache.push_pipeline(h);
        }
        PipelineBinder {
            cache: cache,
            handles: handles,
        }
    }

    /// The handles this scope bound, None when pipeline creation
    /// failed and nothing was pushed.
    pub fn handles(&self) -> Option<PipelineHandles> {
        self.handles
    }
}

impl<'a> Drop for PipelineBinder<'a> {
    fn drop(&mut self) {
        if self.handles.is_some() {
            self.cache.pop_pipeline();
        }
    }
}
