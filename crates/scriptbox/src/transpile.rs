//! Source-to-source rewrite pipeline applied before compilation.

use std::sync::{Arc, LazyLock};

use regex::bytes::{Captures, Regex};
use tokio_util::sync::CancellationToken;

use crate::{
    engine::{CompiledUnit, Engine},
    error::BoxError,
    resolver::ModuleGetter,
    value::Value,
};

/// Marker that bypasses every transpile step for the file containing it.
pub const NO_TRANSPILE: &str = "//box:(transpile) (ignore)";

/// Anything that can rewrite source before compilation.
#[async_trait::async_trait]
pub trait Transpiler: Send + Sync + 'static {
    /// # Errors
    /// Returns the first rewrite failure.
    async fn transpile(&self, src: Vec<u8>) -> Result<Vec<u8>, BoxError>;
}

impl std::fmt::Debug for dyn Transpiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transpiler").finish_non_exhaustive()
    }
}

pub type TranspileStep = Arc<dyn Transpiler>;

/// Ordered list of rewrite steps. Application stops at the first failure.
#[derive(Clone, Default)]
pub struct TranspilerChain {
    steps: Vec<TranspileStep>,
}

impl TranspilerChain {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Steps every sandbox starts with.
    #[must_use]
    pub fn global() -> Self {
        Self {
            steps: vec![
                step(strip_shebang),
                step(expand_grouped_imports),
                step(arrow_functions),
                step(named_functions),
            ],
        }
    }

    pub fn push(&mut self, step: TranspileStep) {
        self.steps.push(step);
    }

    pub fn extend(&mut self, steps: impl IntoIterator<Item = TranspileStep>) {
        self.steps.extend(steps);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    #[must_use]
    pub fn steps(&self) -> &[TranspileStep] {
        &self.steps
    }

    /// Run every step in order.
    ///
    /// # Errors
    /// Returns the error of the first failing step.
    pub async fn transpile(&self, src: Vec<u8>) -> Result<Vec<u8>, BoxError> {
        run_steps(self.steps.iter(), src).await
    }
}

/// Apply `steps` in order unless `src` carries [`NO_TRANSPILE`].
pub(crate) async fn run_steps<'a>(
    steps: impl Iterator<Item = &'a TranspileStep>,
    mut src: Vec<u8>,
) -> Result<Vec<u8>, BoxError> {
    if is_opted_out(&src) {
        return Ok(src);
    }
    for step in steps {
        src = step.transpile(src).await?;
    }
    Ok(src)
}

#[must_use]
pub fn is_opted_out(src: &[u8]) -> bool {
    contains(src, NO_TRANSPILE.as_bytes())
}

#[async_trait::async_trait]
impl Transpiler for TranspilerChain {
    async fn transpile(&self, src: Vec<u8>) -> Result<Vec<u8>, BoxError> {
        Self::transpile(self, src).await
    }
}

impl core::fmt::Debug for TranspilerChain {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TranspilerChain")
            .field("steps", &self.steps.len())
            .finish()
    }
}

impl FromIterator<TranspileStep> for TranspilerChain {
    fn from_iter<I: IntoIterator<Item = TranspileStep>>(iter: I) -> Self {
        Self {
            steps: iter.into_iter().collect(),
        }
    }
}

struct FnStep<F>(F);

#[async_trait::async_trait]
impl<F> Transpiler for FnStep<F>
where
    F: Fn(Vec<u8>) -> Result<Vec<u8>, BoxError> + Send + Sync + 'static,
{
    async fn transpile(&self, src: Vec<u8>) -> Result<Vec<u8>, BoxError> {
        (self.0)(src)
    }
}

pub fn step(
    f: impl Fn(Vec<u8>) -> Result<Vec<u8>, BoxError> + Send + Sync + 'static,
) -> TranspileStep {
    Arc::new(FnStep(f))
}

/// Regex replacement step; `replacement` may reference capture groups as `$1`.
///
/// # Errors
/// Returns an error if `pattern` is not a valid regex.
pub fn replace(pattern: &str, replacement: &str) -> Result<TranspileStep, regex::Error> {
    let re = Regex::new(pattern)?;
    let replacement = replacement.as_bytes().to_vec();
    Ok(step(move |src| {
        Ok(re.replace_all(&src, replacement.as_slice()).into_owned())
    }))
}

/// Regex step whose replacement is computed per match.
///
/// # Errors
/// Returns an error if `pattern` is not a valid regex.
pub fn replace_with(
    pattern: &str,
    f: impl Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static,
) -> Result<TranspileStep, regex::Error> {
    let re = Regex::new(pattern)?;
    Ok(step(move |src| {
        Ok(re
            .replace_all(&src, |caps: &Captures<'_>| f(&caps[0]))
            .into_owned())
    }))
}

/// Step backed by a script. The script sees the source as the global
/// `input` and leaves the rewritten source in `output`.
pub struct ScriptStep {
    unit: Box<dyn CompiledUnit>,
}

impl ScriptStep {
    pub const INPUT: &'static str = "input";
    pub const OUTPUT: &'static str = "output";

    /// Compile the rewriting script once; every rewrite runs a fork of it.
    ///
    /// # Errors
    /// Returns the engine's compile error.
    pub async fn compile(
        engine: &dyn Engine,
        script: &[u8],
        file_name: &str,
        imports: &dyn ModuleGetter,
    ) -> Result<Self, BoxError> {
        let declared = [Self::INPUT.to_string(), Self::OUTPUT.to_string()];
        let mut unit = engine.compile(script, &declared, file_name, imports).await?;
        unit.set(Self::INPUT, Value::from(""))?;
        unit.set(Self::OUTPUT, Value::from(""))?;
        Ok(Self { unit })
    }
}

#[async_trait::async_trait]
impl Transpiler for ScriptStep {
    async fn transpile(&self, src: Vec<u8>) -> Result<Vec<u8>, BoxError> {
        let input = match String::from_utf8(src) {
            Ok(text) => Value::String(text),
            Err(e) => Value::Bytes(e.into_bytes().into()),
        };
        let mut unit = self.unit.fork();
        unit.set(Self::INPUT, input)?;
        unit.run(&CancellationToken::new()).await?;
        match unit.get(Self::OUTPUT) {
            Some(Value::String(text)) => Ok(text.into_bytes()),
            Some(Value::Bytes(bytes)) => Ok(bytes.to_vec()),
            other => Err(format!(
                "transpile script left {} in {}",
                other.as_ref().map_or("nothing", Value::type_name),
                Self::OUTPUT,
            )
            .into()),
        }
    }
}

/// Turn a leading `#!` interpreter line into a line comment.
///
/// # Errors
/// Never fails.
pub fn strip_shebang(mut src: Vec<u8>) -> Result<Vec<u8>, BoxError> {
    if src.starts_with(b"#!") {
        src[..2].copy_from_slice(b"//");
    }
    Ok(src)
}

static GROUPED_IMPORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?ms)^[ \t]*import\s*\(([^)]*)\)").expect("static regex")
});
static ARROW_FUNCTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)\((.*?)\)=>").expect("static regex"));
static NAMED_FUNCTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)func\s*(\S+)\s*\(").expect("static regex"));

/// `(a, b)=>` becomes `func(a, b)`.
///
/// # Errors
/// Never fails.
pub fn arrow_functions(src: Vec<u8>) -> Result<Vec<u8>, BoxError> {
    Ok(ARROW_FUNCTION
        .replace_all(&src, b"func(${1})".as_slice())
        .into_owned())
}

/// `func name(` becomes `name:=func(`.
///
/// # Errors
/// Never fails.
pub fn named_functions(src: Vec<u8>) -> Result<Vec<u8>, BoxError> {
    Ok(NAMED_FUNCTION
        .replace_all(&src, b"${1}:=func(".as_slice())
        .into_owned())
}

/// Expand `import(a, b.c)` into one declaration per name:
/// `a:=import("a");c:=import("b").c`. Names listed on separate lines keep
/// their line breaks.
///
/// # Errors
/// Never fails.
pub fn expand_grouped_imports(src: Vec<u8>) -> Result<Vec<u8>, BoxError> {
    Ok(GROUPED_IMPORT
        .replace_all(&src, |caps: &Captures<'_>| {
            let names = String::from_utf8_lossy(&caps[1]);
            let mut out = String::new();
            let mut separator = "";
            for item in names.split(',') {
                let name = item.trim_matches(|c: char| c.is_whitespace() || c == '"');
                if name.is_empty() {
                    continue;
                }
                out.push_str(separator);
                match name.split_once('.') {
                    Some((module, member)) => {
                        let alias = member.rsplit('.').next().unwrap_or(member);
                        out.push_str(&format!("{alias}:=import(\"{module}\").{member}"));
                    }
                    None => out.push_str(&format!("{name}:=import(\"{name}\")")),
                }
                separator = if item.contains('\n') { "\n" } else { ";" };
            }
            out.into_bytes()
        })
        .into_owned())
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}
