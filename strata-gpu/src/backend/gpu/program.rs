//! WGSL programs of engine passes.
//!
//! A [`PassProgram`] lists what a pass reads and writes. Its source is
//! generated per program: texture groups become bindings with `<group>_texel`
//! and `<group>_packed` accessors, targets become the `PassOutput` struct.

use std::fmt::Write;

use crate::backend::{Blend, ScenePass, ScreenPass, ShaderSet};
use crate::constants::{MAX_COLOR_TARGETS, NO_SPLIT};
use crate::shaders;

use super::WgpuTexture;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Constant {
    U32(u32),
    Bool(bool),
}

#[derive(Debug, Clone)]
pub(super) struct PassProgram {
    pub name: &'static str,
    body: &'static str,
    scene: bool,
    slice_helpers: bool,
    constants: Vec<(&'static str, Constant)>,
    /// Texture groups in binding order, starting at binding 1.
    pub inputs: Vec<(&'static str, Vec<WgpuTexture>)>,
    pub targets: Vec<(WgpuTexture, Blend)>,
    pub settings: [f32; 4],
    pub quantiles: [f32; 8],
}

impl PassProgram {
    fn new(name: &'static str, body: &'static str, scene: bool) -> Self {
        Self {
            name,
            body,
            scene,
            slice_helpers: false,
            constants: Vec::new(),
            inputs: Vec::new(),
            targets: Vec::new(),
            settings: [0.0; 4],
            quantiles: [0.0; 8],
        }
    }

    fn with_u32(mut self, name: &'static str, value: usize) -> Self {
        self.constants.push((name, Constant::U32(value as u32)));
        self
    }

    fn with_bool(mut self, name: &'static str, value: bool) -> Self {
        self.constants.push((name, Constant::Bool(value)));
        self
    }

    fn with_input(mut self, name: &'static str, textures: &[WgpuTexture]) -> Self {
        self.inputs.push((name, textures.to_vec()));
        self
    }

    /// Binds the split points and pulls in `slice_of`.
    fn with_partition(mut self, partition: &[WgpuTexture]) -> Self {
        self.slice_helpers = true;
        self.with_input("partition", partition)
    }

    fn with_targets<'a>(mut self, targets: impl IntoIterator<Item = (&'a WgpuTexture, Blend)>) -> Self {
        self.targets = targets.into_iter().map(|(t, blend)| (*t, blend)).collect();
        self
    }

    fn with_opacity_threshold(mut self, threshold: f32) -> Self {
        self.settings[0] = threshold;
        self
    }

    fn with_quantiles(mut self, quantiles: &[f32]) -> Self {
        for (slot, q) in self.quantiles.iter_mut().zip(quantiles) {
            *slot = *q;
        }
        self.with_u32("QUANTILES", quantiles.len())
    }

    pub fn is_scene(&self) -> bool {
        self.scene
    }

    pub fn input_count(&self) -> usize {
        self.inputs.iter().map(|(_, textures)| textures.len()).sum()
    }

    pub fn input_textures(&self) -> impl Iterator<Item = &WgpuTexture> {
        self.inputs.iter().flat_map(|(_, textures)| textures)
    }

    pub fn scene(pass: &ScenePass<'_, WgpuTexture>) -> Self {
        let program = PassProgram::new(pass.name(), scene_body(pass), true);
        let program = match *pass {
            ScenePass::DepthComplexity { .. } | ScenePass::DepthBounds { .. } => program,
            ScenePass::FirstCount {
                bounds,
                alpha_aware,
                ..
            } => program
                .with_bool("ALPHA_AWARE", alpha_aware)
                .with_input("bounds", std::slice::from_ref(bounds)),
            ScenePass::RefineCount {
                bounds,
                codes,
                levels,
                alpha_aware,
                ..
            } => program
                .with_bool("ALPHA_AWARE", alpha_aware)
                .with_u32("LEVELS", levels as usize)
                .with_input("bounds", std::slice::from_ref(bounds))
                .with_input("codes", codes),
            ScenePass::SliceCount {
                partition, slices, ..
            }
            | ScenePass::LayerFirst {
                partition, slices, ..
            } => program.with_u32("SLICES", slices).with_partition(partition),
            ScenePass::LayerPeel {
                partition,
                previous,
                accumulated,
                depths,
                slices,
                points,
                opacity_threshold,
                alpha_aware,
                ..
            } => program
                .with_u32("SLICES", slices)
                .with_u32("LAST_POINT", points.max(1) - 1)
                .with_u32("DEPTH_TARGETS", depths.len())
                .with_bool("ALPHA_AWARE", alpha_aware)
                .with_opacity_threshold(opacity_threshold)
                .with_partition(partition)
                .with_input("previous", previous)
                .with_input("accumulated", accumulated),
            ScenePass::SingleFirst { .. } => program,
            ScenePass::SinglePeel { previous, .. } => {
                program.with_input("previous", std::slice::from_ref(previous))
            }
        };
        program.with_targets(pass.targets())
    }

    /// Programs of a screen pass. Passes with more targets than a render
    /// pass can hold are split into several programs.
    pub fn screen(pass: &ScreenPass<'_, WgpuTexture>) -> Vec<Self> {
        let program = PassProgram::new(pass.name(), screen_body(pass), false);
        let program = match *pass {
            ScreenPass::FirstSearch {
                counts,
                codes,
                quantiles,
                alpha_aware,
                opacity_threshold,
                ..
            } => program
                .with_bool("ALPHA_AWARE", alpha_aware)
                .with_u32("CODE_TARGETS", codes.len())
                .with_quantiles(quantiles)
                .with_opacity_threshold(opacity_threshold)
                .with_input("counts", counts),
            ScreenPass::RefineSearch {
                counts,
                total,
                codes_in,
                lefts_in,
                codes_out,
                quantiles,
                levels,
                ..
            } => program
                .with_u32("LEVELS", levels as usize)
                .with_u32("CODE_TARGETS", codes_out.len())
                .with_quantiles(quantiles)
                .with_input("counts", counts)
                .with_input("total", std::slice::from_ref(total))
                .with_input("codes_in", codes_in)
                .with_input("lefts_in", lefts_in),
            ScreenPass::Reproject {
                bounds,
                total,
                codes,
                lefts,
                counts,
                quantiles,
                levels,
                alpha_aware,
                ..
            } => program
                .with_u32("LEVELS", levels as usize)
                .with_u32("LAST_LEVEL", (levels.max(1) - 1) as usize)
                .with_bool("ALPHA_AWARE", alpha_aware)
                .with_quantiles(quantiles)
                .with_input("bounds", std::slice::from_ref(bounds))
                .with_input("total", std::slice::from_ref(total))
                .with_input("codes", codes)
                .with_input("lefts", lefts)
                .with_input("counts", counts),
            ScreenPass::LayerBlend { colors, slices, .. } => {
                let program = program.with_u32("SLICES", slices).with_input("colors", colors);
                return pass
                    .targets()
                    .chunks(MAX_COLOR_TARGETS)
                    .enumerate()
                    .map(|(chunk, targets)| {
                        program
                            .clone()
                            .with_u32("FIRST_TARGET", chunk * MAX_COLOR_TARGETS)
                            .with_targets(targets.iter().copied())
                    })
                    .collect();
            }
            ScreenPass::LayerComposite {
                fronts,
                backs,
                slices,
                ..
            } => program
                .with_u32("SLICES", slices)
                .with_input("fronts", fronts)
                .with_input("backs", backs),
            ScreenPass::TileBlend { color, origin, .. } => {
                let mut program = program.with_input("color", std::slice::from_ref(color));
                program.settings[1] = origin[0] as f32;
                program.settings[2] = origin[1] as f32;
                program
            }
            ScreenPass::Resolve { source, .. } => {
                program.with_input("source", std::slice::from_ref(source))
            }
        };
        vec![program.with_targets(pass.targets())]
    }

    /// Writes `value` into `target` through a full-viewport pass.
    pub fn clear(target: &WgpuTexture, value: [f32; 4]) -> Self {
        let mut program = PassProgram::new("clear", shaders::CLEAR, false)
            .with_targets([(target, Blend::Replace)]);
        program.settings = value;
        program
    }

    /// Complete WGSL source, with a state set's snippets in place of the
    /// default shading of scene passes.
    pub fn source(&self, extra: Option<&ShaderSet>) -> String {
        let mut source = String::new();
        let _ = writeln!(source, "// {}", self.name);
        let _ = writeln!(source, "const OUTPUTS: u32 = {}u;", self.targets.len());
        for (name, value) in &self.constants {
            let _ = match value {
                Constant::U32(v) => writeln!(source, "const {name}: u32 = {v}u;"),
                Constant::Bool(v) => writeln!(source, "const {name}: bool = {v};"),
            };
        }

        let mut binding = 1;
        for (group, textures) in &self.inputs {
            for i in 0..textures.len() {
                let _ = writeln!(
                    source,
                    "@group(0) @binding({binding}) var {group}_{i}: texture_2d<f32>;"
                );
                binding += 1;
            }
            let _ = writeln!(
                source,
                "fn {group}_texel(index: u32, pixel: vec2<i32>) -> vec4<f32> {{\n    switch index {{"
            );
            for i in 0..textures.len() {
                let _ = writeln!(
                    source,
                    "        case {i}u: {{ return textureLoad({group}_{i}, pixel, 0); }}"
                );
            }
            let _ = writeln!(
                source,
                "        default: {{ return vec4<f32>({NO_SPLIT:e}); }}\n    }}\n}}"
            );
            let _ = writeln!(
                source,
                "fn {group}_packed(index: u32, pixel: vec2<i32>) -> f32 {{\n    \
                 let texel = {group}_texel(index / 4u, pixel);\n    return texel[index % 4u];\n}}"
            );
        }

        source.push_str("struct PassOutput {\n");
        for i in 0..self.targets.len() {
            let _ = writeln!(source, "    @location({i}) out_{i}: vec4<f32>,");
        }
        source.push_str("}\nfn collect_outputs() -> PassOutput {\n    var collected: PassOutput;\n");
        for i in 0..self.targets.len() {
            let _ = writeln!(source, "    collected.out_{i} = outputs[{i}];");
        }
        source.push_str("    return collected;\n}\n");

        source.push_str(shaders::PRELUDE);
        if self.slice_helpers {
            source.push_str(shaders::SLICES);
        }
        if self.scene {
            source.push_str(shaders::SCENE);
            let extra = extra.cloned().unwrap_or_default();
            source.push_str(extra.vertex.as_deref().unwrap_or(shaders::SCENE_VERTEX));
            source.push('\n');
            source.push_str(extra.fragment.as_deref().unwrap_or(shaders::SCENE_FRAGMENT));
            source.push('\n');
        } else {
            source.push_str(shaders::SCREEN);
        }
        source.push_str(self.body);
        source
    }
}

fn scene_body(pass: &ScenePass<'_, WgpuTexture>) -> &'static str {
    match pass {
        ScenePass::DepthComplexity { .. } => shaders::DEPTH_COMPLEXITY,
        ScenePass::DepthBounds { .. } => shaders::DEPTH_BOUNDS,
        ScenePass::FirstCount { .. } => shaders::FIRST_COUNT,
        ScenePass::RefineCount { .. } => shaders::REFINE_COUNT,
        ScenePass::SliceCount { .. } => shaders::SLICE_COUNT,
        ScenePass::LayerFirst { .. } => shaders::LAYER_FIRST,
        ScenePass::LayerPeel { .. } => shaders::LAYER_PEEL,
        ScenePass::SingleFirst { .. } => shaders::SINGLE_FIRST,
        ScenePass::SinglePeel { .. } => shaders::SINGLE_PEEL,
    }
}

fn screen_body(pass: &ScreenPass<'_, WgpuTexture>) -> &'static str {
    match pass {
        ScreenPass::FirstSearch { .. } => shaders::FIRST_SEARCH,
        ScreenPass::RefineSearch { .. } => shaders::REFINE_SEARCH,
        ScreenPass::Reproject { .. } => shaders::REPROJECT,
        ScreenPass::LayerBlend { .. } => shaders::LAYER_BLEND,
        ScreenPass::LayerComposite { .. } => shaders::LAYER_COMPOSITE,
        ScreenPass::TileBlend { .. } => shaders::TILE_BLEND,
        ScreenPass::Resolve { .. } => shaders::RESOLVE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn textures(count: usize) -> Vec<WgpuTexture> {
        (0..count).map(|_| WgpuTexture::next()).collect()
    }

    #[test]
    fn test_layer_peel_program_binds_groups_in_order() {
        let partition = textures(1);
        let previous = textures(2);
        let accumulated = textures(3);
        let depths = textures(2);
        let colors = textures(2);
        let pass = ScenePass::LayerPeel {
            partition: &partition,
            previous: &previous,
            accumulated: &accumulated,
            depths: &depths,
            colors: &colors,
            slices: 3,
            points: 2,
            opacity_threshold: 0.9,
            alpha_aware: false,
        };
        let program = PassProgram::scene(&pass);
        assert_eq!(program.input_count(), 6);
        assert_eq!(program.targets.len(), 4);
        assert_eq!(program.settings[0], 0.9);

        let source = program.source(None);
        assert!(source.contains("const OUTPUTS: u32 = 4u;"));
        assert!(source.contains("const LAST_POINT: u32 = 1u;"));
        assert!(source.contains("@group(0) @binding(1) var partition_0: texture_2d<f32>;"));
        assert!(source.contains("@group(0) @binding(6) var accumulated_2: texture_2d<f32>;"));
        assert!(source.contains("fn slice_of("));
        assert!(source.contains("@location(3) out_3"));
    }

    #[test]
    fn test_single_layer_partition_still_declares_accessors() {
        let depths = textures(1);
        let pass = ScenePass::LayerFirst {
            partition: &[],
            depths: &depths,
            slices: 1,
        };
        let source = PassProgram::scene(&pass).source(None);
        assert!(source.contains("fn partition_texel("));
        assert!(!source.contains("var partition_0"));
    }

    #[test]
    fn test_extra_shaders_replace_default_shading() {
        let depth = textures(1);
        let program = PassProgram::scene(&ScenePass::SingleFirst { depth: &depth[0] });
        let extra = ShaderSet {
            vertex: None,
            fragment: Some("fn shade_fragment(fragment_in: Varying) -> vec4<f32> { return vec4<f32>(1.0); }".into()),
        };
        let source = program.source(Some(&extra));
        assert!(source.contains("return vec4<f32>(1.0); }"));
        assert!(!source.contains("shade_lambert(fragment_in.normal"));
        assert!(source.contains("fn shade_vertex("));
    }

    #[test]
    fn test_wide_layer_blend_is_split() {
        let colors = textures(4);
        let fronts = textures(8);
        let backs = textures(8);
        let pass = ScreenPass::LayerBlend {
            colors: &colors,
            fronts: &fronts,
            backs: &backs,
            slices: 8,
        };
        let programs = PassProgram::screen(&pass);
        assert_eq!(programs.len(), 2);
        assert!(programs.iter().all(|p| p.targets.len() == MAX_COLOR_TARGETS));
        assert_eq!(programs[1].targets[0].0, backs[0]);
        assert!(programs[1].source(None).contains("const FIRST_TARGET: u32 = 8u;"));
    }
}
