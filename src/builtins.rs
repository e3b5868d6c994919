// Copyright 2026 The Cascade Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

//! The `func:` builtin table for parameter expressions.
//!
//! Builtins operate on already-substituted argument strings and return
//! plain strings. Failures are reported as `ERROR:`-prefixed values
//! rather than faults so the resolver can carry them to whoever needed
//! the parameter.

use std::fs;
use std::path::Path;
use std::time::SystemTime;

use crate::common::error_value;
use crate::interpreter::{self, NoIdents};

/// Split an argument list on commas, honoring double quotes: commas
/// inside a quoted section do not separate arguments, and surrounding
/// quotes are stripped from the result.
pub fn split_args(raw: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for c in raw.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                args.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    args.push(current);

    if args.len() == 1 && args[0].trim().is_empty() {
        return Vec::new();
    }
    args.into_iter().map(|a| a.trim().to_string()).collect()
}

fn arity<'a>(name: &str, args: &'a [String], min: usize, max: usize) -> Result<&'a [String], String> {
    if args.len() < min || args.len() > max {
        Err(error_value(format!(
            "function '{name}' expects {min}..{max} arguments, got {}",
            args.len()
        )))
    } else {
        Ok(args)
    }
}

fn modified(path: &str) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn bool_str(b: bool) -> String {
    if b { "1".to_string() } else { "0".to_string() }
}

/// Invoke builtin `name` on a raw (comma-joined) argument string.
/// Unknown names and arity mismatches produce `ERROR:` values.
pub fn call(name: &str, raw_args: &str) -> String {
    let args = split_args(raw_args);
    match dispatch(name, &args) {
        Ok(value) => value,
        Err(err_value) => err_value,
    }
}

fn dispatch(name: &str, args: &[String]) -> Result<String, String> {
    match name {
        "fileBaseName" => {
            let args = arity(name, args, 1, 1)?;
            let path = Path::new(&args[0]);
            Ok(path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default())
        }
        "fileDirName" => {
            let args = arity(name, args, 1, 1)?;
            let path = Path::new(&args[0]);
            Ok(path
                .parent()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default())
        }
        "fileSuffix" => {
            let args = arity(name, args, 1, 1)?;
            let path = Path::new(&args[0]);
            Ok(path
                .extension()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default())
        }
        "isEmpty" => {
            let args = arity(name, args, 1, 1)?;
            Ok(bool_str(args[0].is_empty()))
        }
        "strLength" => {
            let args = arity(name, args, 1, 1)?;
            Ok(args[0].chars().count().to_string())
        }
        "substring" => {
            let args = arity(name, args, 2, 3)?;
            let start = parse_index(name, &args[1])?;
            let chars: Vec<char> = args[0].chars().collect();
            let start = start.min(chars.len());
            let end = match args.get(2) {
                Some(len) => (start + parse_index(name, len)?).min(chars.len()),
                None => chars.len(),
            };
            Ok(chars[start..end].iter().collect())
        }
        "strCompare" => {
            let args = arity(name, args, 2, 2)?;
            let ord = args[0].cmp(&args[1]);
            Ok((ord as i8).to_string())
        }
        "contains" => {
            let args = arity(name, args, 2, 2)?;
            Ok(bool_str(args[0].contains(args[1].as_str())))
        }
        "listItem" => {
            let args = arity(name, args, 3, 3)?;
            let idx = parse_index(name, &args[1])?;
            let items: Vec<&str> = split_list(&args[0], &args[2]);
            match items.get(idx) {
                Some(item) => Ok((*item).to_string()),
                None => Err(error_value(format!(
                    "listItem index {idx} out of range (list has {} items)",
                    items.len()
                ))),
            }
        }
        "listLength" => {
            let args = arity(name, args, 2, 2)?;
            Ok(split_list(&args[0], &args[1]).len().to_string())
        }
        "cond" => {
            let args = arity(name, args, 3, 3)?;
            // the test is itself a math expression
            match interpreter::eval_str(&args[0], &NoIdents) {
                Ok(n) => {
                    if interpreter::is_truthy(n) {
                        Ok(args[1].clone())
                    } else {
                        Ok(args[2].clone())
                    }
                }
                Err(err) => Err(error_value(format!("cond test '{}': {err}", args[0]))),
            }
        }
        "fileIsNewer" => {
            let args = arity(name, args, 2, 2)?;
            let newer = match (modified(&args[0]), modified(&args[1])) {
                (Some(a), Some(b)) => a > b,
                // a missing file is never newer; a missing reference
                // always is (the rebuild-if-stale idiom)
                (None, _) => false,
                (Some(_), None) => true,
            };
            Ok(bool_str(newer))
        }
        _ => Err(error_value(format!("unknown function '{name}'"))),
    }
}

fn parse_index(name: &str, arg: &str) -> Result<usize, String> {
    arg.trim()
        .parse::<usize>()
        .map_err(|_| error_value(format!("function '{name}': '{arg}' is not an index")))
}

fn split_list<'a>(list: &'a str, sep: &str) -> Vec<&'a str> {
    if list.is_empty() {
        return Vec::new();
    }
    if sep.is_empty() {
        return vec![list];
    }
    list.split(sep).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::is_error_value;
    use std::fs::File;
    use std::io::Write;

    #[test]
    fn quote_aware_split() {
        assert_eq!(split_args("a, b, c"), vec!["a", "b", "c"]);
        assert_eq!(split_args("\"a, b\", c"), vec!["a, b", "c"]);
        assert_eq!(split_args(""), Vec::<String>::new());
        assert_eq!(split_args("one"), vec!["one"]);
        // an empty trailing argument survives
        assert_eq!(split_args("a,"), vec!["a", ""]);
    }

    #[test]
    fn path_decomposition() {
        assert_eq!(call("fileBaseName", "/data/raster.tif"), "raster");
        assert_eq!(call("fileDirName", "/data/raster.tif"), "/data");
        assert_eq!(call("fileSuffix", "/data/raster.tif"), "tif");
        assert_eq!(call("fileSuffix", "/data/raster"), "");
    }

    #[test]
    fn string_ops() {
        assert_eq!(call("strLength", "\"abcd\""), "4");
        assert_eq!(call("isEmpty", "\"\""), "1");
        assert_eq!(call("isEmpty", "x"), "0");
        assert_eq!(call("substring", "abcdef, 1, 3"), "bcd");
        assert_eq!(call("substring", "abcdef, 4"), "ef");
        assert_eq!(call("contains", "catchment, catch"), "1");
        assert_eq!(call("strCompare", "a, b"), "-1");
        assert_eq!(call("strCompare", "b, b"), "0");
    }

    #[test]
    fn list_ops() {
        assert_eq!(call("listLength", "a;b;c, ;"), "3");
        assert_eq!(call("listItem", "a;b;c, 1, ;"), "b");
        assert!(is_error_value(&call("listItem", "a;b;c, 9, ;")));
    }

    #[test]
    fn cond_evaluates_math_test() {
        assert_eq!(call("cond", "2 > 1, yes, no"), "yes");
        assert_eq!(call("cond", "0, yes, no"), "no");
        assert!(is_error_value(&call("cond", "nonsense ident, yes, no")));
    }

    #[test]
    fn unknown_function_is_error_value() {
        let out = call("frobnicate", "1, 2");
        assert!(is_error_value(&out));
        assert!(out.contains("frobnicate"));
    }

    #[test]
    fn arity_mismatch_is_error_value() {
        assert!(is_error_value(&call("strLength", "a, b")));
    }

    #[test]
    fn file_is_newer() {
        let dir = tempfile::tempdir().unwrap();
        let older = dir.path().join("older.txt");
        let newer = dir.path().join("newer.txt");
        File::create(&older).unwrap().write_all(b"a").unwrap();
        // mtime granularity on some filesystems is a full second
        std::thread::sleep(std::time::Duration::from_millis(1100));
        File::create(&newer).unwrap().write_all(b"b").unwrap();

        let args = format!("{}, {}", newer.display(), older.display());
        assert_eq!(call("fileIsNewer", &args), "1");
        let args = format!("{}, {}", older.display(), newer.display());
        assert_eq!(call("fileIsNewer", &args), "0");

        let missing = dir.path().join("missing.txt");
        let args = format!("{}, {}", older.display(), missing.display());
        assert_eq!(call("fileIsNewer", &args), "1");
        let args = format!("{}, {}", missing.display(), older.display());
        assert_eq!(call("fileIsNewer", &args), "0");
    }
}
