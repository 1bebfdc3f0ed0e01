//! Program synthesis
//!
//! Wraps a snippet into a complete binary crate. The generated program has
//! one entry point, which calls `snippet::Snippet::eval()` and writes the
//! rendered value to the result slot named by its first argument.
//!
//! The snippet becomes the body of a closure inside `Snippet::eval`, so a
//! `return` in the snippet returns from the closure. The produced value is
//! rendered through autoref-based dispatch: `Display` if the type has it,
//! otherwise `Debug`, otherwise the type's name. `()` and `None` render as no
//! value, and `Some(v)` renders as `v`.
//!
//! The unit arm sits on the outermost reference level and is the only arm
//! there. A closure whose type is still open at that point (a body that
//! never returns, such as `loop {}` or `panic!(..)`) settles on `()` instead
//! of matching several arms at once.

use std::fmt::Write;

use tracing::debug;

use crate::types::CompilationUnit;

/// Name the snippet's closure is bound to in the generated source
pub const SNIPPET_BINDING: &str = "__snippet_body";

/// What compiler messages say instead of [`SNIPPET_BINDING`]
pub const SNIPPET_PLACEHOLDER: &str = "<snippet>";

const PRELUDE: &str = r#"#![forbid(unsafe_code)]
#![allow(unused_imports, unused_variables, unused_mut, unreachable_code, dead_code)]

fn main() {
    std::panic::set_hook(Box::new(|info| {
        let payload = info.payload();
        if let Some(message) = payload.downcast_ref::<&str>() {
            eprintln!("{message}");
        } else if let Some(message) = payload.downcast_ref::<String>() {
            eprintln!("{message}");
        } else {
            eprintln!("snippet panicked");
        }
    }));

    let Some(slot) = std::env::args_os().nth(1) else {
        std::process::exit(2);
    };
    let value = snippet::Snippet::eval().unwrap_or_default();
    if std::fs::write(slot, value).is_err() {
        std::process::exit(3);
    }
}

mod render {
    pub struct Value<T>(pub T);

    pub trait RenderUnit {
        fn render(&self) -> Option<String>;
    }

    impl RenderUnit for &&&&&Value<()> {
        fn render(&self) -> Option<String> {
            None
        }
    }

    pub trait RenderOptionDisplay {
        fn render(&self) -> Option<String>;
    }

    impl<T: std::fmt::Display> RenderOptionDisplay for &&&&Value<Option<T>> {
        fn render(&self) -> Option<String> {
            self.0.as_ref().map(|value| value.to_string())
        }
    }

    pub trait RenderOptionDebug {
        fn render(&self) -> Option<String>;
    }

    impl<T: std::fmt::Debug> RenderOptionDebug for &&&Value<Option<T>> {
        fn render(&self) -> Option<String> {
            self.0.as_ref().map(|value| format!("{value:?}"))
        }
    }

    pub trait RenderDisplay {
        fn render(&self) -> Option<String>;
    }

    impl<T: std::fmt::Display> RenderDisplay for &&Value<T> {
        fn render(&self) -> Option<String> {
            Some(self.0.to_string())
        }
    }

    pub trait RenderDebug {
        fn render(&self) -> Option<String>;
    }

    impl<T: std::fmt::Debug> RenderDebug for &Value<T> {
        fn render(&self) -> Option<String> {
            Some(format!("{:?}", self.0))
        }
    }

    pub trait RenderOpaque {
        fn render(&self) -> Option<String>;
    }

    impl<T> RenderOpaque for Value<T> {
        fn render(&self) -> Option<String> {
            Some(std::any::type_name::<T>().to_string())
        }
    }
}
"#;

/// Build the compilation unit for `snippet`
///
/// Every namespace becomes a `use` declaration inside the `snippet` module.
/// The snippet text is copied verbatim, starting at column 1 of its own line,
/// so compiler columns inside the snippet need no adjustment.
pub fn synthesize(snippet: &str, namespaces: &[String]) -> CompilationUnit {
    let mut source = String::with_capacity(PRELUDE.len() + snippet.len() + 512);
    source.push_str(PRELUDE);

    source.push_str("\nmod snippet {\n");
    source.push_str(
        "    use crate::render::{\n        \
         RenderDebug, RenderDisplay, RenderOpaque, RenderOptionDebug, RenderOptionDisplay, \
         RenderUnit,\n    };\n",
    );
    for namespace in namespaces {
        // Writing to a String cannot fail
        let _ = writeln!(source, "    use {namespace};");
    }
    source.push_str("\n    pub struct Snippet;\n\n");
    source.push_str("    impl Snippet {\n");
    source.push_str("        pub fn eval() -> Option<String> {\n");
    let _ = writeln!(source, "            let {SNIPPET_BINDING} = || {{");

    let snippet_line = source.lines().count() + 1;
    source.push_str(snippet);
    if !snippet.ends_with('\n') {
        source.push('\n');
    }

    source.push_str("            };\n");
    let _ = writeln!(
        source,
        "            (&&&&&&crate::render::Value({SNIPPET_BINDING}())).render()"
    );
    source.push_str("        }\n    }\n}\n");

    let snippet_lines = snippet.lines().count().max(1);
    debug!(snippet_line, snippet_lines, len = source.len(), "synthesized program");

    CompilationUnit {
        source,
        snippet_line,
        snippet_lines,
    }
}
