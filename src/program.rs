// program.rs — Kernel programs and the variant → argument table.
//
// The kernels ship as WGSL text under src/shaders/, one file per variant:
//
//   convolution.wgsl          scalar tile load    (naive, aligned)
//   convolution_read4.wgsl    4-wide tile load    (vectorized)
//   convolution_global.wgsl   no tile             (any strategy, global memory)
//
// Each file starts with a `// version: N` header that must match
// PROGRAM_VERSION; the tests below fail if one is edited without the other.
//
// TEMPLATING:
// WGSL needs a constant length for `var<workgroup>` arrays, and naga does
// not accept `override` expressions in @workgroup_size, so the workgroup
// shape and tile length are substituted into the text per geometry. The
// {{WG_X}}, {{WG_Y}} and {{TILE_LEN}} tokens are the only templated parts;
// the untiled program has no {{TILE_LEN}}.
//
// ARGUMENT TABLE:
// `KernelVariant::arg_layout()` lists the kernel's arguments in order.
// Devices never hard-code a layout: they walk the bound `KernelArgs`.
// Buffer arguments take bindings 0, 1, 2, … in table order, followed by
// one uniform binding holding the scalar arguments, in table order, as
// consecutive u32 fields (the WGSL `Params` struct). `tile` is the
// workgroup array; on the GPU its size is fixed by {{TILE_LEN}}, on the
// host device it sizes the per-worker tile. A layout without `tile` is an
// untiled program.

use std::fmt;

use crate::config::KernelMemory;
use crate::device::DeviceBuffers;
use crate::error::{ConvolveError, Result};
use crate::geometry::{AccessStrategy, Geometry};

/// Version of the kernel program text. Bump together with the WGSL headers.
pub const PROGRAM_VERSION: u32 = 1;

const CONVOLUTION_WGSL: &str = include_str!("shaders/convolution.wgsl");
const CONVOLUTION_READ4_WGSL: &str = include_str!("shaders/convolution_read4.wgsl");
const CONVOLUTION_GLOBAL_WGSL: &str = include_str!("shaders/convolution_global.wgsl");

// ---------------------------------------------------------------------------
// Arguments
// ---------------------------------------------------------------------------

/// One kernel argument slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelArg {
    /// Input plane, read one f32 at a time.
    InputImage,
    /// Input plane, read as vec4<f32>.
    InputImageQuads,
    OutputImage,
    Filter,
    Rows,
    Cols,
    Pitch,
    FilterWidth,
    /// Workgroup tile, sized in bytes.
    LocalTile,
    LocalHeight,
    LocalWidth,
}

/// What kind of value an argument takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    Buffer { writable: bool },
    Scalar,
    Local,
}

impl KernelArg {
    /// Name of the matching WGSL global or `Params` field.
    pub fn name(self) -> &'static str {
        match self {
            KernelArg::InputImage | KernelArg::InputImageQuads => "image_in",
            KernelArg::OutputImage => "image_out",
            KernelArg::Filter => "coeffs",
            KernelArg::Rows => "rows",
            KernelArg::Cols => "cols",
            KernelArg::Pitch => "pitch",
            KernelArg::FilterWidth => "filter_width",
            KernelArg::LocalTile => "tile",
            KernelArg::LocalHeight => "local_height",
            KernelArg::LocalWidth => "local_width",
        }
    }

    pub fn kind(self) -> ArgKind {
        match self {
            KernelArg::InputImage | KernelArg::InputImageQuads | KernelArg::Filter => {
                ArgKind::Buffer { writable: false }
            }
            KernelArg::OutputImage => ArgKind::Buffer { writable: true },
            KernelArg::LocalTile => ArgKind::Local,
            KernelArg::Rows
            | KernelArg::Cols
            | KernelArg::Pitch
            | KernelArg::FilterWidth
            | KernelArg::LocalHeight
            | KernelArg::LocalWidth => ArgKind::Scalar,
        }
    }
}

const SCALAR_LOAD_LAYOUT: &[KernelArg] = &[
    KernelArg::InputImage,
    KernelArg::OutputImage,
    KernelArg::Filter,
    KernelArg::Rows,
    KernelArg::Cols,
    KernelArg::Pitch,
    KernelArg::FilterWidth,
    KernelArg::LocalTile,
    KernelArg::LocalHeight,
    KernelArg::LocalWidth,
];

const VECTOR_LOAD_LAYOUT: &[KernelArg] = &[
    KernelArg::InputImageQuads,
    KernelArg::OutputImage,
    KernelArg::Filter,
    KernelArg::Rows,
    KernelArg::Cols,
    KernelArg::Pitch,
    KernelArg::FilterWidth,
    KernelArg::LocalTile,
    KernelArg::LocalHeight,
    KernelArg::LocalWidth,
];

const GLOBAL_LAYOUT: &[KernelArg] = &[
    KernelArg::InputImage,
    KernelArg::OutputImage,
    KernelArg::Filter,
    KernelArg::Rows,
    KernelArg::Cols,
    KernelArg::Pitch,
    KernelArg::FilterWidth,
];

// ---------------------------------------------------------------------------
// Variants
// ---------------------------------------------------------------------------

/// The kernel programs this crate ships.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelVariant {
    /// Scalar tile load.
    Convolution,
    /// 4-wide tile load.
    ConvolutionRead4,
    /// No tile; every window is read from global memory.
    ConvolutionGlobal,
}

impl KernelVariant {
    pub const ALL: [KernelVariant; 3] = [
        KernelVariant::Convolution,
        KernelVariant::ConvolutionRead4,
        KernelVariant::ConvolutionGlobal,
    ];

    /// The tiled program each access strategy runs.
    pub fn for_strategy(strategy: AccessStrategy) -> Self {
        match strategy {
            AccessStrategy::Naive | AccessStrategy::Aligned => KernelVariant::Convolution,
            AccessStrategy::Vectorized => KernelVariant::ConvolutionRead4,
        }
    }

    /// The program a pass runs. Untiled passes read scalars whatever the
    /// strategy; the strategy still decides the device row layout.
    pub fn select(strategy: AccessStrategy, memory: KernelMemory) -> Self {
        match memory {
            KernelMemory::Tiled => Self::for_strategy(strategy),
            KernelMemory::Global => KernelVariant::ConvolutionGlobal,
        }
    }

    /// WGSL entry point, also used as the program label.
    pub fn entry_point(self) -> &'static str {
        match self {
            KernelVariant::Convolution => "convolution",
            KernelVariant::ConvolutionRead4 => "convolution_read4",
            KernelVariant::ConvolutionGlobal => "convolution_global",
        }
    }

    /// Ordered argument layout.
    pub fn arg_layout(self) -> &'static [KernelArg] {
        match self {
            KernelVariant::Convolution => SCALAR_LOAD_LAYOUT,
            KernelVariant::ConvolutionRead4 => VECTOR_LOAD_LAYOUT,
            KernelVariant::ConvolutionGlobal => GLOBAL_LAYOUT,
        }
    }

    /// Un-instantiated WGSL text.
    pub fn template(self) -> &'static str {
        match self {
            KernelVariant::Convolution => CONVOLUTION_WGSL,
            KernelVariant::ConvolutionRead4 => CONVOLUTION_READ4_WGSL,
            KernelVariant::ConvolutionGlobal => CONVOLUTION_GLOBAL_WGSL,
        }
    }

    /// True if the kernel caches a tile in workgroup memory.
    pub fn uses_tile(self) -> bool {
        self.arg_layout().contains(&KernelArg::LocalTile)
    }

    /// True if the kernel loads its tile four elements at a time.
    pub fn loads_quads(self) -> bool {
        self.arg_layout().contains(&KernelArg::InputImageQuads)
    }
}

impl fmt::Display for KernelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.entry_point())
    }
}

// ---------------------------------------------------------------------------
// Bound arguments
// ---------------------------------------------------------------------------

/// A resolved argument value.
#[derive(Debug)]
pub enum ArgValue<'a, B> {
    Buffer(&'a B),
    Scalar(u32),
    /// Workgroup memory in bytes.
    Local(u32),
}

// Manual impls: derive would require `B: Clone`/`B: Copy`.
impl<B> Clone for ArgValue<'_, B> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<B> Copy for ArgValue<'_, B> {}

/// A variant's argument table resolved against one pass's buffers and geometry.
#[derive(Debug)]
pub struct KernelArgs<'a, B> {
    variant: KernelVariant,
    values: Vec<(KernelArg, ArgValue<'a, B>)>,
}

impl<'a, B> KernelArgs<'a, B> {
    /// Resolve every slot of `variant`'s layout.
    pub fn bind(variant: KernelVariant, buffers: &'a DeviceBuffers<B>, geometry: &Geometry) -> Self {
        let values = variant
            .arg_layout()
            .iter()
            .map(|&arg| {
                let value = match arg {
                    KernelArg::InputImage | KernelArg::InputImageQuads => {
                        ArgValue::Buffer(&buffers.input)
                    }
                    KernelArg::OutputImage => ArgValue::Buffer(&buffers.output),
                    KernelArg::Filter => ArgValue::Buffer(&buffers.filter),
                    KernelArg::Rows => ArgValue::Scalar(geometry.image_height),
                    KernelArg::Cols => ArgValue::Scalar(geometry.image_width),
                    KernelArg::Pitch => ArgValue::Scalar(geometry.device_pitch),
                    KernelArg::FilterWidth => ArgValue::Scalar(geometry.filter_width),
                    KernelArg::LocalTile => ArgValue::Local(geometry.shared_bytes),
                    KernelArg::LocalHeight => ArgValue::Scalar(geometry.local_height),
                    KernelArg::LocalWidth => ArgValue::Scalar(geometry.local_width),
                };
                (arg, value)
            })
            .collect();
        KernelArgs { variant, values }
    }

    /// Build from explicit values, bypassing the table. Devices must cope
    /// with missing or mistyped slots.
    pub fn from_values(variant: KernelVariant, values: Vec<(KernelArg, ArgValue<'a, B>)>) -> Self {
        KernelArgs { variant, values }
    }

    pub fn variant(&self) -> KernelVariant {
        self.variant
    }

    /// All bound slots, in layout order.
    pub fn iter(&self) -> impl Iterator<Item = &(KernelArg, ArgValue<'a, B>)> {
        self.values.iter()
    }

    fn get(&self, arg: KernelArg) -> Option<ArgValue<'a, B>> {
        self.values.iter().find(|(a, _)| *a == arg).map(|&(_, v)| v)
    }

    /// The buffer bound to `arg`, if `arg` is bound to a buffer.
    pub fn buffer(&self, arg: KernelArg) -> Option<&'a B> {
        match self.get(arg)? {
            ArgValue::Buffer(b) => Some(b),
            _ => None,
        }
    }

    /// The scalar bound to `arg`, if `arg` is bound to a scalar.
    pub fn scalar(&self, arg: KernelArg) -> Option<u32> {
        match self.get(arg)? {
            ArgValue::Scalar(v) => Some(v),
            _ => None,
        }
    }

    /// Workgroup memory requested through the `tile` slot.
    pub fn local_bytes(&self) -> Option<u32> {
        self.values.iter().find_map(|&(_, v)| match v {
            ArgValue::Local(bytes) => Some(bytes),
            _ => None,
        })
    }

    /// Buffer arguments with their binding index.
    pub fn buffer_bindings(&self) -> impl Iterator<Item = (u32, KernelArg, &'a B)> + '_ {
        self.values
            .iter()
            .filter_map(|&(arg, v)| match v {
                ArgValue::Buffer(b) => Some((arg, b)),
                _ => None,
            })
            .enumerate()
            .map(|(i, (arg, b))| (i as u32, arg, b))
    }

    /// Scalar arguments packed as the `Params` uniform, zero-padded to a
    /// multiple of four words.
    pub fn uniform_words(&self) -> Vec<u32> {
        let mut words: Vec<u32> = self
            .values
            .iter()
            .filter_map(|&(_, v)| match v {
                ArgValue::Scalar(s) => Some(s),
                _ => None,
            })
            .collect();
        let padded = words.len().div_ceil(4).max(1) * 4;
        words.resize(padded, 0);
        words
    }
}

/// Name a missing argument in a dispatch error.
pub fn missing_arg(variant: KernelVariant, arg: KernelArg) -> String {
    format!("kernel `{variant}` has no {} argument bound", arg.name())
}

// ---------------------------------------------------------------------------
// Programs
// ---------------------------------------------------------------------------

/// A kernel program instantiated for one geometry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelProgram {
    variant: KernelVariant,
    source: String,
    workgroup: (u32, u32),
    tile_len: u32,
}

impl KernelProgram {
    /// Substitute the geometry into `variant`'s template.
    pub fn instantiate(variant: KernelVariant, geometry: &Geometry) -> Self {
        Self::from_template(variant, variant.template(), geometry)
    }

    /// Instantiate arbitrary template text. Used to exercise build failures.
    pub fn from_template(variant: KernelVariant, template: &str, geometry: &Geometry) -> Self {
        let wg = geometry.workgroup;
        let tile_len = if variant.uses_tile() { geometry.tile_len() } else { 0 };
        let source = template
            .replace("{{WG_X}}", &wg.width.to_string())
            .replace("{{WG_Y}}", &wg.height.to_string())
            .replace("{{TILE_LEN}}", &tile_len.to_string());
        KernelProgram { variant, source, workgroup: (wg.width, wg.height), tile_len }
    }

    pub fn variant(&self) -> KernelVariant {
        self.variant
    }

    pub fn entry_point(&self) -> &'static str {
        self.variant.entry_point()
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Workgroup shape baked into the text.
    pub fn workgroup(&self) -> (u32, u32) {
        self.workgroup
    }

    /// Length of the `tile` workgroup array; 0 for an untiled program.
    pub fn tile_len(&self) -> u32 {
        self.tile_len
    }

    /// The `// version: N` header, if present.
    pub fn version(&self) -> Option<u32> {
        self.source
            .lines()
            .take_while(|l| l.starts_with("//"))
            .find_map(|l| l.trim_start_matches('/').trim().strip_prefix("version:"))
            .and_then(|v| v.trim().parse().ok())
    }

    /// Parse and validate the program, returning the module.
    ///
    /// # Errors
    /// `BuildFailure` with the full diagnostic if the text does not parse,
    /// does not validate, or lacks the variant's entry point.
    pub fn validate(&self) -> Result<naga::Module> {
        let module = naga::front::wgsl::parse_str(&self.source)
            .map_err(|e| self.build_failure(e.emit_to_string(&self.source)))?;

        let mut validator = naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::all(),
        );
        validator.validate(&module).map_err(|e| self.build_failure(error_chain(&e)))?;

        let entry = module
            .entry_points
            .iter()
            .find(|ep| ep.name == self.entry_point())
            .ok_or_else(|| {
                self.build_failure(format!("entry point `{}` not found", self.entry_point()))
            })?;
        let expected = [self.workgroup.0, self.workgroup.1, 1];
        if entry.workgroup_size != expected {
            return Err(self.build_failure(format!(
                "entry point `{}` has workgroup size {:?}, expected {:?}",
                self.entry_point(),
                entry.workgroup_size,
                expected
            )));
        }
        Ok(module)
    }

    fn build_failure(&self, log: String) -> ConvolveError {
        ConvolveError::BuildFailure { program: self.variant.entry_point().to_string(), log }
    }
}

/// Flatten an error and its sources into one diagnostic string.
pub(crate) fn error_chain(err: &dyn std::error::Error) -> String {
    let mut log = err.to_string();
    let mut source = err.source();
    while let Some(s) = source {
        log.push_str(": ");
        log.push_str(&s.to_string());
        source = s.source();
    }
    log
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::WorkgroupShape;

    fn geometry(strategy: AccessStrategy) -> Geometry {
        Geometry::plan(64, 48, 7, WorkgroupShape::new(16, 16), strategy).unwrap()
    }

    /// Names of the struct fields of the `Params` uniform.
    fn params_fields(module: &naga::Module) -> Vec<String> {
        module
            .types
            .iter()
            .find_map(|(_, ty)| match (&ty.name, &ty.inner) {
                (Some(name), naga::TypeInner::Struct { members, .. }) if name == "Params" => {
                    Some(members.iter().filter_map(|m| m.name.clone()).collect())
                }
                _ => None,
            })
            .expect("Params struct present")
    }

    #[test]
    fn test_strategy_to_variant() {
        assert_eq!(KernelVariant::for_strategy(AccessStrategy::Naive), KernelVariant::Convolution);
        assert_eq!(KernelVariant::for_strategy(AccessStrategy::Aligned), KernelVariant::Convolution);
        assert_eq!(
            KernelVariant::for_strategy(AccessStrategy::Vectorized),
            KernelVariant::ConvolutionRead4
        );
        assert!(KernelVariant::ConvolutionRead4.loads_quads());
        assert!(!KernelVariant::Convolution.loads_quads());
        assert!(!KernelVariant::ConvolutionGlobal.loads_quads());
        for s in AccessStrategy::ALL {
            assert_eq!(KernelVariant::select(s, KernelMemory::Tiled), KernelVariant::for_strategy(s));
            assert_eq!(KernelVariant::select(s, KernelMemory::Global), KernelVariant::ConvolutionGlobal);
        }
    }

    #[test]
    fn test_templates_carry_current_version() {
        let g = geometry(AccessStrategy::Vectorized);
        for variant in KernelVariant::ALL {
            let p = KernelProgram::instantiate(variant, &g);
            assert_eq!(p.version(), Some(PROGRAM_VERSION), "{variant}");
        }
    }

    #[test]
    fn test_instantiation_replaces_every_token() {
        let g = geometry(AccessStrategy::Vectorized);
        let p = KernelProgram::instantiate(KernelVariant::ConvolutionRead4, &g);
        assert!(!p.source().contains("{{"), "unreplaced token left in program");
        assert!(p.source().contains("array<f32, 528>"));
        assert!(p.source().contains("@workgroup_size(16, 16, 1)"));
        assert_eq!(p.tile_len(), 24 * 22);
    }

    #[test]
    fn test_shipped_programs_validate() {
        for s in AccessStrategy::ALL {
            let g = geometry(s);
            let p = KernelProgram::instantiate(KernelVariant::for_strategy(s), &g);
            p.validate().unwrap_or_else(|e| panic!("{s}: {e}"));
        }
        // Odd shapes too.
        let g = Geometry::plan(40, 30, 3, WorkgroupShape::new(5, 3), AccessStrategy::Aligned).unwrap();
        KernelProgram::instantiate(KernelVariant::Convolution, &g).validate().unwrap();
        KernelProgram::instantiate(KernelVariant::ConvolutionGlobal, &g).validate().unwrap();
        let g = Geometry::plan(40, 30, 3, WorkgroupShape::new(5, 3), AccessStrategy::Vectorized).unwrap();
        KernelProgram::instantiate(KernelVariant::ConvolutionRead4, &g).validate().unwrap();
    }

    #[test]
    fn test_layout_matches_program_text() {
        for variant in KernelVariant::ALL {
            let g = geometry(if variant.loads_quads() {
                AccessStrategy::Vectorized
            } else {
                AccessStrategy::Naive
            });
            let module = KernelProgram::instantiate(variant, &g).validate().unwrap();

            // Buffer arguments, then the uniform, in binding order.
            let mut bound: Vec<(u32, String)> = module
                .global_variables
                .iter()
                .filter_map(|(_, gv)| Some((gv.binding.as_ref()?.binding, gv.name.clone()?)))
                .collect();
            bound.sort();
            let mut expected: Vec<String> = variant
                .arg_layout()
                .iter()
                .filter(|a| matches!(a.kind(), ArgKind::Buffer { .. }))
                .map(|a| a.name().to_string())
                .collect();
            expected.push("params".to_string());
            let names: Vec<String> = bound.into_iter().map(|(_, n)| n).collect();
            assert_eq!(names, expected, "{variant}");

            // Scalar arguments in Params field order.
            let scalars: Vec<&str> = variant
                .arg_layout()
                .iter()
                .filter(|a| a.kind() == ArgKind::Scalar)
                .map(|a| a.name())
                .collect();
            let fields = params_fields(&module);
            assert_eq!(&fields[..scalars.len()], scalars.as_slice(), "{variant}");
            // The uniform is exactly as long as the packed words.
            assert_eq!(fields.len() % 4, 0, "{variant}");

            // The workgroup array is the `tile` slot, present only when listed.
            let has_tile = module
                .global_variables
                .iter()
                .any(|(_, gv)| gv.name.as_deref() == Some(KernelArg::LocalTile.name())
                    && gv.space == naga::AddressSpace::WorkGroup);
            assert_eq!(has_tile, variant.uses_tile(), "{variant}");
        }
    }

    #[test]
    fn test_global_variant_has_no_tile() {
        let g = geometry(AccessStrategy::Aligned);
        let p = KernelProgram::instantiate(KernelVariant::ConvolutionGlobal, &g);
        assert_eq!(p.tile_len(), 0);
        assert!(!p.source().contains("workgroupBarrier"));

        let buffers = DeviceBuffers { input: 1u8, output: 2u8, filter: 3u8 };
        let args = KernelArgs::bind(KernelVariant::ConvolutionGlobal, &buffers, &g);
        assert_eq!(args.local_bytes(), None);
        assert_eq!(args.scalar(KernelArg::LocalWidth), None);
        // rows, cols, pitch, filter_width
        assert_eq!(args.uniform_words(), vec![48, 64, 64, 7]);
    }

    #[test]
    fn test_broken_program_reports_log() {
        let g = geometry(AccessStrategy::Naive);
        let broken = CONVOLUTION_WGSL.replace("workgroupBarrier();", "workgroupBarrier(;");
        let p = KernelProgram::from_template(KernelVariant::Convolution, &broken, &g);
        match p.validate() {
            Err(ConvolveError::BuildFailure { program, log }) => {
                assert_eq!(program, "convolution");
                assert!(!log.is_empty());
            }
            other => panic!("expected BuildFailure, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_entry_point_is_build_failure() {
        let g = geometry(AccessStrategy::Naive);
        let renamed = CONVOLUTION_WGSL.replace("fn convolution(", "fn convolve(");
        let p = KernelProgram::from_template(KernelVariant::Convolution, &renamed, &g);
        let err = p.validate().unwrap_err();
        assert!(err.to_string().contains("entry point `convolution` not found"));
    }

    #[test]
    fn test_bind_resolves_table() {
        let g = geometry(AccessStrategy::Aligned);
        let buffers = DeviceBuffers { input: 1u8, output: 2u8, filter: 3u8 };
        let args = KernelArgs::bind(KernelVariant::Convolution, &buffers, &g);
        assert_eq!(args.buffer(KernelArg::InputImage), Some(&1));
        assert_eq!(args.buffer(KernelArg::OutputImage), Some(&2));
        assert_eq!(args.scalar(KernelArg::Cols), Some(64));
        assert_eq!(args.scalar(KernelArg::Pitch), Some(64));
        assert_eq!(args.scalar(KernelArg::Rows), Some(48));
        assert_eq!(args.local_bytes(), Some(22 * 22 * 4));
        assert_eq!(args.buffer(KernelArg::InputImageQuads), None);
        assert_eq!(args.scalar(KernelArg::InputImage), None);

        let bindings: Vec<_> = args.buffer_bindings().map(|(i, a, &b)| (i, a, b)).collect();
        assert_eq!(
            bindings,
            vec![
                (0, KernelArg::InputImage, 1),
                (1, KernelArg::OutputImage, 2),
                (2, KernelArg::Filter, 3)
            ]
        );
        // rows, cols, pitch, filter_width, local_height, local_width, pad, pad
        assert_eq!(args.uniform_words(), vec![48, 64, 64, 7, 22, 22, 0, 0]);
    }
}
