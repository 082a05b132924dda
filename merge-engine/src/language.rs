//! Per-extension structural patterns.
//!
//! Structure is recovered with regular expressions rather than a parser:
//! each supported language supplies an import pattern, a function-name
//! pattern, an optional hook-call pattern, and a block style that tells us
//! where a function body ends. All regexes are compiled once in `LazyLock`
//! statics; analyzers clone the compiled patterns into their own table.

use regex::Regex;
use std::sync::LazyLock;

static PY_IMPORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:from\s+(\.*[\w.]*)\s+import\s|import\s+([\w.]+))")
        .expect("PY_IMPORT should be valid")
});

static PY_FUNCTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:async\s+)?def\s+([A-Za-z_]\w*)\s*\(").expect("PY_FUNCTION should be valid")
});

static JS_IMPORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"^(?:import\s+(?:type\s+)?(?:[^'"]*?\s+from\s+)?['"]([^'"]+)['"]|(?:const|let|var)\s+[^=]+=\s*require\(\s*['"]([^'"]+)['"]\s*\))"#,
    )
    .expect("JS_IMPORT should be valid")
});

static JS_FUNCTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?:export\s+)?(?:default\s+)?(?:async\s+)?function\s*\*?\s*([A-Za-z_$][\w$]*)\s*[<(]|^\s*(?:export\s+)?(?:const|let|var)\s+([A-Za-z_$][\w$]*)\s*(?::[^=]+)?=\s*(?:async\s+)?(?:function\b|(?:<[^>]*>\s*)?\([^)]*\)\s*(?::[^=]+)?=>|[A-Za-z_$][\w$]*\s*=>)",
    )
    .expect("JS_FUNCTION should be valid")
});

static JS_HOOK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(use[A-Z][A-Za-z0-9_]*)\s*(?:<[^>]*>)?\s*\(").expect("JS_HOOK should be valid")
});

/// How a function body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStyle {
    /// Body is every following line indented deeper than the signature.
    Indent,
    /// Body is enclosed in balanced braces.
    Braces,
}

/// Languages with built-in patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Language {
    Python,
    JavaScript,
    TypeScript,
}

impl Language {
    /// Infer language from a file extension, with or without the leading dot.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match normalize_extension(ext).as_str() {
            "py" => Some(Language::Python),
            "js" | "jsx" => Some(Language::JavaScript),
            "ts" | "tsx" => Some(Language::TypeScript),
            _ => None,
        }
    }

    /// Extensions registered by default.
    pub fn builtin_extensions() -> &'static [&'static str] {
        &["py", "js", "jsx", "ts", "tsx"]
    }

    pub fn patterns(&self) -> LanguagePatterns {
        match self {
            Language::Python => LanguagePatterns {
                import: PY_IMPORT.clone(),
                function: PY_FUNCTION.clone(),
                hook: None,
                block_style: BlockStyle::Indent,
            },
            Language::JavaScript | Language::TypeScript => LanguagePatterns {
                import: JS_IMPORT.clone(),
                function: JS_FUNCTION.clone(),
                hook: Some(JS_HOOK.clone()),
                block_style: BlockStyle::Braces,
            },
        }
    }
}

/// Lowercase, without the leading dot.
pub fn normalize_extension(ext: &str) -> String {
    ext.trim().trim_start_matches('.').to_ascii_lowercase()
}

/// Extension of a path-like string, normalized. Empty when there is none.
pub fn extension_of(path: &str) -> String {
    std::path::Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(normalize_extension)
        .unwrap_or_default()
}

/// A function located in a list of lines. Indices are 0-based and inclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionBlock {
    pub name: String,
    pub start: usize,
    /// Last line of the signature (where the body opens).
    pub signature_end: usize,
    pub end: usize,
}

impl FunctionBlock {
    pub fn text(&self, lines: &[&str]) -> String {
        lines[self.start..=self.end].join("\n")
    }
}

/// Compiled patterns for one extension.
#[derive(Debug, Clone)]
pub struct LanguagePatterns {
    pub import: Regex,
    pub function: Regex,
    pub hook: Option<Regex>,
    pub block_style: BlockStyle,
}

impl LanguagePatterns {
    pub fn new(
        import: Regex,
        function: Regex,
        hook: Option<Regex>,
        block_style: BlockStyle,
    ) -> Self {
        Self {
            import,
            function,
            hook,
            block_style,
        }
    }

    pub fn is_import(&self, line: &str) -> bool {
        self.import.is_match(line.trim())
    }

    /// Module named by an import line: the first capture group that matched,
    /// or the whole trimmed line when the pattern has none.
    pub fn import_target(&self, line: &str) -> Option<String> {
        let trimmed = line.trim();
        let caps = self.import.captures(trimmed)?;
        let target = caps
            .iter()
            .skip(1)
            .flatten()
            .map(|m| m.as_str())
            .find(|s| !s.is_empty())
            .unwrap_or(trimmed);
        Some(target.to_string())
    }

    pub fn function_name(&self, line: &str) -> Option<String> {
        let caps = self.function.captures(line)?;
        caps.iter()
            .skip(1)
            .flatten()
            .map(|m| m.as_str().to_string())
            .next()
    }

    /// Hook name when the line is a hook call statement.
    pub fn hook_name(&self, line: &str) -> Option<String> {
        let hook = self.hook.as_ref()?;
        let caps = hook.captures(line.trim())?;
        caps.get(1).map(|m| m.as_str().to_string())
    }

    /// Every function whose signature matches, in source order.
    pub fn find_functions(&self, lines: &[&str]) -> Vec<FunctionBlock> {
        let mut blocks = Vec::new();
        for (i, line) in lines.iter().enumerate() {
            let Some(name) = self.function_name(line) else {
                continue;
            };
            let (signature_end, end) = match self.block_style {
                BlockStyle::Indent => indent_block(lines, i),
                BlockStyle::Braces => brace_block(lines, i),
            };
            blocks.push(FunctionBlock {
                name,
                start: i,
                signature_end,
                end,
            });
        }
        blocks
    }

    /// First function with the given name.
    pub fn find_function(&self, lines: &[&str], name: &str) -> Option<FunctionBlock> {
        self.find_functions(lines).into_iter().find(|b| b.name == name)
    }
}

fn indent_of(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

fn indent_block(lines: &[&str], start: usize) -> (usize, usize) {
    let base = indent_of(lines[start]);

    // Signatures may wrap; the body opens on the line ending with ':'.
    let mut signature_end = start;
    for (j, line) in lines.iter().enumerate().skip(start) {
        let code = line.split('#').next().unwrap_or("").trim_end();
        if code.ends_with(':') {
            signature_end = j;
            break;
        }
        if j > start && !line.trim().is_empty() && indent_of(line) <= base {
            break;
        }
    }

    let mut end = signature_end;
    for (j, line) in lines.iter().enumerate().skip(signature_end + 1) {
        if line.trim().is_empty() {
            continue;
        }
        if indent_of(line) <= base {
            break;
        }
        end = j;
    }
    (signature_end, end)
}

fn brace_block(lines: &[&str], start: usize) -> (usize, usize) {
    let mut depth: i64 = 0;
    let mut seen_brace = false;
    let mut signature_end = start;
    let mut scanner = CodeScanner::default();

    for (j, line) in lines.iter().enumerate().skip(start) {
        for c in scanner.code_chars(line) {
            match c {
                '{' => {
                    if !seen_brace {
                        seen_brace = true;
                        signature_end = j;
                    }
                    depth += 1;
                }
                '(' | '[' => depth += 1,
                '}' | ')' | ']' => depth -= 1,
                _ => {}
            }
        }

        if depth > 0 {
            continue;
        }
        let trimmed = line.trim_end();
        if seen_brace {
            return (signature_end, j);
        }
        let continues = trimmed.ends_with("=>")
            || trimmed.ends_with('=')
            || trimmed.ends_with(',')
            || trimmed.is_empty();
        if !continues {
            return (start, j);
        }
    }
    (signature_end, lines.len().saturating_sub(1))
}

/// Skips string literals and line comments when counting brackets.
#[derive(Default)]
struct CodeScanner {
    quote: Option<char>,
    block_comment: bool,
}

impl CodeScanner {
    fn code_chars(&mut self, line: &str) -> Vec<char> {
        let mut out = Vec::new();
        let chars: Vec<char> = line.chars().collect();
        let mut i = 0;
        while i < chars.len() {
            let c = chars[i];
            let next = chars.get(i + 1).copied();
            if self.block_comment {
                if c == '*' && next == Some('/') {
                    self.block_comment = false;
                    i += 1;
                }
            } else if let Some(q) = self.quote {
                if c == '\\' {
                    i += 1;
                } else if c == q {
                    self.quote = None;
                }
            } else {
                match (c, next) {
                    ('/', Some('/')) => break,
                    ('/', Some('*')) => {
                        self.block_comment = true;
                        i += 1;
                    }
                    ('"', _) | ('\'', _) | ('`', _) => self.quote = Some(c),
                    _ => out.push(c),
                }
            }
            i += 1;
        }
        // Only template literals span lines.
        if matches!(self.quote, Some('"') | Some('\'')) {
            self.quote = None;
        }
        out
    }
}
