//! Transition program source assembly.
//!
//! A transition snippet defines `vec4 transition(vec2 uv)` in the
//! gl-transitions dialect. It is substituted into [`FRAGMENT_TEMPLATE`], which
//! supplies the samplers, uniforms and `getFromColor`/`getToColor` helpers the
//! snippet expects.

use crate::error::{Result, TransitionError};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Upper bound on snippet size accepted for compilation.
pub const MAX_SNIPPET_BYTES: usize = 64 * 1024;

const TRANSITION_PLACEHOLDER: &str = "{{TRANSITION}}";

/// Vertex stage shared by every transition.
pub const VERTEX_SHADER: &str = r"#version 450
layout(location = 0) in vec2 position;
layout(location = 0) out vec2 _uv;

void main() {
    gl_Position = vec4(position, 0.0, 1.0);
    _uv = position * 0.5 + 0.5;
}
";

/// Fragment template. The uniform block layout must match `TransitionUniforms`.
const FRAGMENT_TEMPLATE: &str = r"#version 450
layout(location = 0) in vec2 _uv;
layout(location = 0) out vec4 _fragColor;

layout(std140, set = 0, binding = 0) uniform TransitionParams {
    float _progress;
    float _ratio;
    float _fromRatio;
    float _toRatio;
} _params;

layout(set = 0, binding = 1) uniform texture2D _fromTexture;
layout(set = 0, binding = 2) uniform texture2D _toTexture;
layout(set = 0, binding = 3) uniform sampler _sampler;

#define progress _params._progress
#define ratio _params._ratio
#define _fromR _params._fromRatio
#define _toR _params._toRatio
#define from sampler2D(_fromTexture, _sampler)
#define to sampler2D(_toTexture, _sampler)
#define texture2D texture

vec4 getFromColor(vec2 uv) {
    return texture(from, vec2(uv.x, 1.0 - uv.y));
}

vec4 getToColor(vec2 uv) {
    return texture(to, vec2(uv.x, 1.0 - uv.y));
}

{{TRANSITION}}
void main() {
    _fragColor = transition(_uv);
}
";

/// Linear cross-fade used when no external snippet is configured.
pub const DEFAULT_TRANSITION: &str = r"vec4 transition(vec2 uv) {
    return mix(
        getFromColor(uv),
        getToColor(uv),
        progress
    );
}
";

/// Where the transition snippet came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnippetOrigin {
    BuiltIn,
    File(PathBuf),
}

/// A tunable `uniform` from a gl-transitions snippet, folded into a constant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionParameter {
    pub ty: String,
    pub name: String,
    pub value: String,
}

/// Complete, validated GLSL sources for one transition program.
#[derive(Debug, Clone)]
pub struct ProgramSource {
    origin: SnippetOrigin,
    fragment: String,
    parameters: Vec<TransitionParameter>,
}

impl ProgramSource {
    /// Reads the configured snippet, or selects the cross-fade when `path` is `None`.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                info!("Loading transition source from {:?}", path);
                let snippet = fs::read_to_string(path).map_err(|source| {
                    TransitionError::SourceRead {
                        path: path.to_path_buf(),
                        source,
                    }
                })?;
                Self::compose(&snippet, SnippetOrigin::File(path.to_path_buf()))
            }
            None => {
                info!("Using built-in cross-fade transition");
                Self::compose(DEFAULT_TRANSITION, SnippetOrigin::BuiltIn)
            }
        }
    }

    /// Substitutes `snippet` into the fragment template.
    pub fn compose(snippet: &str, origin: SnippetOrigin) -> Result<Self> {
        validate_snippet(snippet)?;
        let (body, parameters) = sanitize_snippet(snippet)?;
        let fragment = FRAGMENT_TEMPLATE.replacen(TRANSITION_PLACEHOLDER, &body, 1);
        debug!("Fragment shader source:\n{}", fragment);
        Ok(Self {
            origin,
            fragment,
            parameters,
        })
    }

    pub fn vertex(&self) -> &str {
        VERTEX_SHADER
    }

    pub fn fragment(&self) -> &str {
        &self.fragment
    }

    pub fn origin(&self) -> &SnippetOrigin {
        &self.origin
    }

    pub fn parameters(&self) -> &[TransitionParameter] {
        &self.parameters
    }
}

fn validate_snippet(snippet: &str) -> Result<()> {
    if snippet.trim().is_empty() {
        return Err(TransitionError::InvalidSource("snippet is empty".into()));
    }
    if snippet.len() > MAX_SNIPPET_BYTES {
        return Err(TransitionError::InvalidSource(format!(
            "snippet is {} bytes, limit is {}",
            snippet.len(),
            MAX_SNIPPET_BYTES
        )));
    }
    if snippet.contains(TRANSITION_PLACEHOLDER) {
        return Err(TransitionError::InvalidSource(
            "snippet contains the template placeholder".into(),
        ));
    }
    if !defines_transition(snippet) {
        return Err(TransitionError::InvalidSource(
            "snippet does not define `vec4 transition(vec2 uv)`".into(),
        ));
    }
    Ok(())
}

/// Looks for `vec4 transition (` allowing arbitrary whitespace.
fn defines_transition(snippet: &str) -> bool {
    let mut tokens = snippet
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '('))
        .filter(|t| !t.is_empty())
        .peekable();
    while let Some(token) = tokens.next() {
        if token != "vec4" {
            continue;
        }
        let next = tokens.peek().copied();
        match next {
            Some("transition(") => return true,
            Some(next) if next.starts_with("transition(") => return true,
            Some("transition") => {
                tokens.next();
                if tokens.peek().is_some_and(|t| t.starts_with('(')) {
                    return true;
                }
            }
            _ => {}
        }
    }
    false
}

/// Strips directives the template owns and folds loose uniforms into constants.
fn sanitize_snippet(snippet: &str) -> Result<(String, Vec<TransitionParameter>)> {
    let mut body = String::with_capacity(snippet.len());
    let mut parameters = Vec::new();
    for line in snippet.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("#version") || trimmed.starts_with("precision ") {
            continue;
        }
        if let Some(decl) = trimmed.strip_prefix("uniform ") {
            let param = parse_parameter(decl)?;
            body.push_str(&format!(
                "const {} {} = {};\n",
                param.ty, param.name, param.value
            ));
            parameters.push(param);
            continue;
        }
        body.push_str(line);
        body.push('\n');
    }
    Ok((body, parameters))
}

/// Parses `vec2 direction; // = vec2(1.0, 0.0)`.
fn parse_parameter(decl: &str) -> Result<TransitionParameter> {
    let (statement, comment) = match decl.split_once("//") {
        Some((statement, comment)) => (statement, Some(comment)),
        None => (decl, None),
    };
    let statement = statement
        .trim()
        .strip_suffix(';')
        .ok_or_else(|| TransitionError::InvalidSource(format!("malformed uniform `{}`", decl)))?;
    let mut parts = statement.split_whitespace();
    let (ty, name) = match (parts.next(), parts.next(), parts.next()) {
        (Some(ty), Some(name), None) if !name.contains(',') => (ty, name),
        _ => {
            return Err(TransitionError::InvalidSource(format!(
                "unsupported uniform declaration `{}`",
                statement
            )))
        }
    };
    let zero = zero_value(ty).ok_or_else(|| {
        TransitionError::InvalidSource(format!("uniform `{}` has unsupported type `{}`", name, ty))
    })?;
    let value = comment
        .and_then(|c| c.trim().strip_prefix('='))
        .map(|v| v.trim().trim_end_matches(';').trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or(zero);
    Ok(TransitionParameter {
        ty: ty.to_string(),
        name: name.to_string(),
        value,
    })
}

fn zero_value(ty: &str) -> Option<String> {
    let value = match ty {
        "float" => "0.0".to_string(),
        "int" => "0".to_string(),
        "bool" => "false".to_string(),
        "vec2" | "vec3" | "vec4" => format!("{}(0.0)", ty),
        "ivec2" | "ivec3" | "ivec4" => format!("{}(0)", ty),
        "bvec2" | "bvec3" | "bvec4" => format!("{}(false)", ty),
        _ => return None,
    };
    Some(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_source_embeds_cross_fade() {
        let source = ProgramSource::resolve(None).unwrap();
        assert_eq!(source.origin(), &SnippetOrigin::BuiltIn);
        assert!(source.fragment().contains("mix("));
        assert!(source.fragment().contains("_fragColor = transition(_uv);"));
        assert!(!source.fragment().contains(TRANSITION_PLACEHOLDER));
    }

    #[test]
    fn missing_file_is_fatal() {
        let err = ProgramSource::resolve(Some(Path::new("/nonexistent/fade.glsl"))).unwrap_err();
        assert!(matches!(err, TransitionError::SourceRead { .. }));
    }

    #[test]
    fn reads_external_snippet() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "vec4 transition (vec2 uv) {{ return progress < 0.5 ? getFromColor(uv) : getToColor(uv); }}"
        )
        .unwrap();
        let source = ProgramSource::resolve(Some(file.path())).unwrap();
        assert_eq!(source.origin(), &SnippetOrigin::File(file.path().to_path_buf()));
        assert!(source.fragment().contains("progress < 0.5"));
    }

    #[test]
    fn rejects_snippet_without_transition() {
        let err = ProgramSource::compose("vec4 fade(vec2 uv) { return vec4(1.0); }", SnippetOrigin::BuiltIn)
            .unwrap_err();
        assert!(matches!(err, TransitionError::InvalidSource(_)));
        assert!(ProgramSource::compose("   \n", SnippetOrigin::BuiltIn).is_err());
    }

    #[test]
    fn rejects_oversized_snippet() {
        let mut snippet = String::from(DEFAULT_TRANSITION);
        snippet.push_str(&"// padding\n".repeat(MAX_SNIPPET_BYTES / 10));
        assert!(ProgramSource::compose(&snippet, SnippetOrigin::BuiltIn).is_err());
    }

    #[test]
    fn detects_transition_with_spacing() {
        assert!(defines_transition("vec4 transition(vec2 p) {}"));
        assert!(defines_transition("vec4  transition  (vec2 p) {}"));
        assert!(defines_transition("vec4\ntransition\n(vec2 p) {}"));
        assert!(!defines_transition("vec4 transitional(vec2 p) {}"));
        assert!(!defines_transition("float transition(vec2 p) {}"));
    }

    #[test]
    fn folds_uniform_parameters_into_constants() {
        let snippet = "\
#version 300 es
precision mediump float;
uniform vec2 direction; // = vec2(0.0, 1.0)
uniform float smoothness; // = 0.5
uniform int steps;
vec4 transition(vec2 uv) { return mix(getFromColor(uv), getToColor(uv), progress); }
";
        let source = ProgramSource::compose(snippet, SnippetOrigin::BuiltIn).unwrap();
        let fragment = source.fragment();
        assert!(fragment.contains("const vec2 direction = vec2(0.0, 1.0);"));
        assert!(fragment.contains("const float smoothness = 0.5;"));
        assert!(fragment.contains("const int steps = 0;"));
        assert!(!fragment.contains("#version 300 es"));
        assert!(!fragment.contains("precision mediump"));
        assert_eq!(fragment.matches("#version").count(), 1);
        assert_eq!(source.parameters().len(), 3);
        assert_eq!(source.parameters()[1].name, "smoothness");
    }

    #[test]
    fn rejects_sampler_parameters() {
        let snippet = "uniform sampler2D displacementMap;\nvec4 transition(vec2 uv) { return getToColor(uv); }";
        let err = ProgramSource::compose(snippet, SnippetOrigin::BuiltIn).unwrap_err();
        assert!(err.to_string().contains("sampler2D"));
    }
}
