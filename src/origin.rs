//! Call-site resolution for error-level entries.
//!
//! A log call made from application code passes through several frames of
//! the logging machinery before it reaches the formatter. [`resolve`] walks
//! the captured caller frames outward and returns the first one whose module
//! is not on the skip list, so the reported location is the application code
//! that issued the call rather than a logging wrapper.

use crate::entry::ReportLocation;

/// Raw frames dropped before any module inspection: the capture function,
/// the resolver and the entry mapper that invoked it.
pub const CALLER_FRAME_OFFSET: usize = 3;

/// Module paths that belong to the capture machinery and the runtime. Frames
/// from these never count as an origin, whatever the configured skip list.
const INTERNAL_MODULES: &[&str] = &["backtrace", "std", "core", "alloc", env!("CARGO_CRATE_NAME")];

const VENDOR_MARKER: &str = "::vendor::";

/// One caller frame, innermost first when part of a stack.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    /// Declaring module path, e.g. `my_app::handlers`. Empty when unknown.
    pub module: String,
    /// Function name without its module, e.g. `create_user` or
    /// `Router::dispatch::{{closure}}`.
    pub function: String,
    pub file: Option<String>,
    pub line: Option<u32>,
}

impl Frame {
    /// Build a frame from a demangled symbol name such as
    /// `<my_app::Server as tower::Service<Req>>::call` or
    /// `my_app::run::{{closure}}`.
    pub fn from_symbol(symbol: &str, file: Option<String>, line: Option<u32>) -> Self {
        let (module, function) = split_symbol(symbol);
        Frame {
            module,
            function,
            file,
            line,
        }
    }

    fn location(&self) -> ReportLocation {
        ReportLocation {
            file_path: self.file.clone().unwrap_or_default(),
            line_number: self.line.unwrap_or(0),
            function_name: self.function.clone(),
        }
    }
}

/// Walk `frames` outward and return the location of the first frame whose
/// module is not covered by `skip`.
///
/// Returns `None` when every frame is skipped or the stack is empty; this is
/// a normal outcome and callers simply omit the location.
pub fn resolve<S: AsRef<str>>(frames: &[Frame], skip: &[S]) -> Option<ReportLocation> {
    frames
        .iter()
        .filter(|frame| !frame.module.is_empty())
        .find(|frame| {
            let module = strip_vendor(&frame.module);
            !skip.iter().any(|entry| module_matches(module, entry.as_ref()))
        })
        .map(Frame::location)
}

/// `true` when `module` is `entry` itself or nested below it.
pub fn module_matches(module: &str, entry: &str) -> bool {
    match module.strip_prefix(entry) {
        Some(rest) => rest.is_empty() || rest.starts_with("::"),
        None => false,
    }
}

/// Keep only the part of a module path after the last vendoring marker, so a
/// vendored copy of a crate is recognized as that crate.
pub fn strip_vendor(module: &str) -> &str {
    match module.rfind(VENDOR_MARKER) {
        Some(idx) => &module[idx + VENDOR_MARKER.len()..],
        None => module,
    }
}

/// Source of caller frames for [`resolve`].
pub trait FrameSource: Send + Sync {
    /// Frames of the current call stack, innermost first.
    fn caller_frames(&self) -> Vec<Frame>;
}

/// Captures the live call stack with the `backtrace` crate.
///
/// Accurate origins need debug info in the final binary. Release builds
/// should set at least `debug = "line-tables-only"`: without it inlined
/// application frames vanish and the file and line are unknown, so the
/// resolved origin may be a runtime frame such as
/// `__rust_begin_short_backtrace`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BacktraceFrames;

impl FrameSource for BacktraceFrames {
    fn caller_frames(&self) -> Vec<Frame> {
        let mut frames = Vec::new();
        let mut index = 0usize;
        backtrace::trace(|raw| {
            index += 1;
            if index <= CALLER_FRAME_OFFSET {
                return true;
            }
            // Inlined functions resolve to several symbols for one raw frame.
            backtrace::resolve_frame(raw, |symbol| {
                let Some(name) = symbol.name() else {
                    return;
                };
                let frame = Frame::from_symbol(
                    &format!("{:#}", name),
                    symbol.filename().map(|p| p.display().to_string()),
                    symbol.lineno(),
                );
                if !is_internal(&frame.module) {
                    frames.push(frame);
                }
            });
            true
        });
        frames
    }
}

fn is_internal(module: &str) -> bool {
    INTERNAL_MODULES
        .iter()
        .any(|entry| module_matches(module, entry))
}

/// Split a demangled symbol into `(module, function)`.
fn split_symbol(symbol: &str) -> (String, String) {
    let symbol = symbol.trim();

    // `<Type as Trait>::method`: the module is the one declaring `Type`.
    if symbol.starts_with('<') {
        if let Some(close) = matching_angle(symbol) {
            let inner = &symbol[1..close];
            let self_ty = split_top_level(inner, " as ")
                .into_iter()
                .next()
                .unwrap_or(inner);
            let mut ty_path: Vec<String> = split_path(strip_type_prefix(self_ty));
            let rest: Vec<String> = split_path(symbol[close + 1..].trim_start_matches("::"));
            let ty_name = ty_path.pop().unwrap_or_default();
            let mut function = vec![ty_name];
            function.extend(rest);
            function.retain(|s| !s.is_empty());
            return (ty_path.join("::"), function.join("::"));
        }
    }

    let mut path = split_path(symbol);
    let mut function = Vec::new();
    while let Some(last) = path.pop() {
        // `{{closure}}` in legacy mangling, `{closure#0}` in v0.
        let is_closure = last.starts_with("{{closure") || last.starts_with("{closure");
        function.insert(0, last);
        if !is_closure {
            break;
        }
    }
    (path.join("::"), function.join("::"))
}

/// Drop reference and trait-object markers from a self type, so
/// `&mut dyn app::Trait` becomes `app::Trait`.
fn strip_type_prefix(mut ty: &str) -> &str {
    loop {
        let trimmed = ty
            .trim_start()
            .trim_start_matches('&')
            .trim_start_matches("mut ")
            .trim_start_matches("dyn ");
        if trimmed.len() == ty.len() {
            return ty;
        }
        ty = trimmed;
    }
}

/// Split a path on top-level `::`, dropping generic arguments from each segment.
fn split_path(path: &str) -> Vec<String> {
    split_top_level(path, "::")
        .into_iter()
        .map(strip_generics)
        .filter(|s| !s.is_empty())
        .collect()
}

/// Split `s` on `sep` wherever it occurs outside `<...>`.
fn split_top_level<'a>(s: &'a str, sep: &str) -> Vec<&'a str> {
    let bytes = s.as_bytes();
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'<' => depth += 1,
            b'>' if i > 0 && bytes[i - 1] == b'-' => {}
            b'>' => depth -= 1,
            _ if depth == 0 && bytes[i..].starts_with(sep.as_bytes()) => {
                parts.push(&s[start..i]);
                i += sep.len();
                start = i;
                continue;
            }
            _ => {}
        }
        i += 1;
    }
    parts.push(&s[start..]);
    parts
}

/// Index of the `>` closing the `<` at position 0.
fn matching_angle(s: &str) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut depth = 0i32;
    for (i, b) in bytes.iter().enumerate() {
        match b {
            b'<' => depth += 1,
            b'>' if i > 0 && bytes[i - 1] == b'-' => {}
            b'>' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

fn strip_generics(segment: &str) -> String {
    let bytes = segment.as_bytes();
    let mut out = String::with_capacity(segment.len());
    let mut depth = 0i32;
    for (i, c) in segment.char_indices() {
        match c {
            '<' => depth += 1,
            '>' if i > 0 && bytes[i - 1] == b'-' => {}
            '>' => depth -= 1,
            _ if depth == 0 => out.push(c),
            _ => {}
        }
    }
    out.trim().to_string()
}
