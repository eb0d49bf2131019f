//! Read simple variable assignments out of a Makefile.
//!
//! Only literal assignments are understood: `NAME = value`, `NAME := value`,
//! `NAME ?= value`, `NAME ::= value`, optionally prefixed with `export`. The first
//! assignment wins. Values are returned verbatim, with no expansion.

use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("read {path}: {err}")]
    Read { path: PathBuf, err: std::io::Error },

    #[error("variable {name} not found in {path}")]
    VariableNotFound { name: String, path: PathBuf },
}

const OPERATORS: &[&str] = &["::=", ":=", "?=", "+=", "!=", "="];

/// Value of `name` in the Makefile at `path`.
pub fn read_variable(path: &Path, name: &str) -> Result<String, Error> {
    let contents = std::fs::read_to_string(path).map_err(|err| Error::Read {
        path: path.to_path_buf(),
        err,
    })?;
    find_variable(&contents, name).ok_or_else(|| Error::VariableNotFound {
        name: name.to_string(),
        path: path.to_path_buf(),
    })
}

pub fn find_variable(contents: &str, name: &str) -> Option<String> {
    contents.lines().find_map(|line| parse_assignment(line, name))
}

fn parse_assignment(line: &str, name: &str) -> Option<String> {
    // recipe lines are shell, not assignments
    if line.starts_with('\t') {
        return None;
    }
    let line = strip_comment(line).trim();
    let line = line.strip_prefix("export ").map(str::trim_start).unwrap_or(line);
    let rest = line.strip_prefix(name)?.trim_start();
    for op in OPERATORS {
        if let Some(value) = rest.strip_prefix(op) {
            // `+=` and `!=` are not literal values
            if *op == "+=" || *op == "!=" {
                return None;
            }
            return Some(value.trim().to_string());
        }
    }
    None
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(i) => &line[..i],
        None => line,
    }
}
