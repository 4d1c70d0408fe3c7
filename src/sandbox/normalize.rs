//! Heuristic scaffolding for bare code fragments.
//!
//! Each rule detects missing boilerplate with a substring or pattern check and
//! wraps the snippet only when it is plainly absent. Code that already looks
//! complete passes through untouched.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;

use crate::sandbox::template::{normalize_language, LanguageTemplate};

/// Env var telling the Java command which class to launch.
pub const JAVA_CLASS_ENV: &str = "APEX_JAVA_CLASS";

/// Entry file ready to be written into the workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedSource {
    pub content: String,
    pub file_name: String,
    pub env: BTreeMap<String, String>,
}

type Rule = fn(&str, &mut NormalizedSource);

const RULES: &[(&str, Rule)] = &[
    ("go", ensure_go_package as Rule),
    ("rust", ensure_rust_main as Rule),
    ("c", ensure_c_includes as Rule),
    ("cpp", ensure_cpp_includes as Rule),
    ("java", ensure_java_class as Rule),
];

/// Apply the language's scaffolding rule to `code`.
pub fn normalize_primary_code(template: &LanguageTemplate, code: &str) -> NormalizedSource {
    let mut source = NormalizedSource {
        content: code.to_string(),
        file_name: template.file_name.clone(),
        env: BTreeMap::new(),
    };

    let lang = normalize_language(&template.language);
    if let Some((_, rule)) = RULES.iter().find(|(name, _)| *name == lang) {
        rule(code, &mut source);
    }
    source
}

fn ensure_go_package(code: &str, source: &mut NormalizedSource) {
    if !code.contains("package ") {
        source.content = format!("package main\n\n{}", code);
    }
}

fn ensure_rust_main(code: &str, source: &mut NormalizedSource) {
    if !code.contains("fn main") {
        source.content = format!("fn main() {{\n{}\n}}\n", code);
    }
}

fn ensure_c_includes(code: &str, source: &mut NormalizedSource) {
    if !code.contains("#include") {
        source.content = format!("#include <stdio.h>\n#include <stdlib.h>\n\n{}", code);
    }
}

fn ensure_cpp_includes(code: &str, source: &mut NormalizedSource) {
    if !code.contains("#include") {
        source.content = format!("#include <iostream>\nusing namespace std;\n\n{}", code);
    }
}

fn public_class_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"public\s+class\s+([A-Za-z_][A-Za-z0-9_]*)").expect("valid class pattern")
    })
}

fn ensure_java_class(code: &str, source: &mut NormalizedSource) {
    let class_name = match public_class_pattern().captures(code) {
        Some(caps) => caps[1].to_string(),
        None => {
            if !code.contains("class Main") {
                source.content = format!(
                    "public class Main {{\n  public static void main(String[] args) {{\n{}\n  }}\n}}\n",
                    indent_java(code)
                );
            }
            "Main".to_string()
        }
    };

    source.file_name = format!("{}.java", class_name);
    source.env.insert(JAVA_CLASS_ENV.to_string(), class_name);
}

fn indent_java(code: &str) -> String {
    code.split('\n')
        .map(|line| {
            if line.trim().is_empty() {
                String::new()
            } else {
                format!("    {}", line)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}
