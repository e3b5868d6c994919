// Copyright 2026 The Cascade Authors. All rights reserved.
// Use of this source code is governed by the Apache License,
// Version 2.0, that can be found in the LICENSE file.

use super::ErrorCode::*;
use super::Token::*;
use super::{EquationError, ErrorCode, Lexer, Token};

fn test(input: &str, expected: Vec<(&str, Token)>) {
    let tokenizer = Lexer::new(input);
    let len = expected.len();
    for (token, (expected_span, expected_tok)) in tokenizer.zip(expected.into_iter()) {
        let expected_start = expected_span.find('~').unwrap();
        let expected_end = expected_span.rfind('~').unwrap() + 1;
        assert_eq!(Ok((expected_start, expected_tok, expected_end)), token);
    }

    let tokenizer = Lexer::new(input);
    assert_eq!(None, tokenizer.skip(len).next());
}

fn test_err(input: &str, expected: (&str, ErrorCode)) {
    let tokenizer = Lexer::new(input);
    let token = tokenizer.into_iter().last().unwrap();
    let (expected_span, expected_code) = expected;
    let expected_start = expected_span.find('~').unwrap();
    let expected_end = expected_span.rfind('~').unwrap() + 1;
    let expected_err = EquationError {
        start: expected_start as u16,
        end: expected_end as u16,
        code: expected_code,
    };
    assert_eq!(Err(expected_err), token);
}

#[test]
fn ifstmt() {
    test(
        "if 1    then 1 else 0",
        vec![
            ("~~                   ", If),
            ("   ~                 ", Num("1")),
            ("        ~~~~         ", Then),
            ("             ~       ", Num("1")),
            ("               ~~~~  ", Else),
            ("                    ~", Num("0")),
        ],
    );
}

#[test]
fn lte() {
    test("<=", vec![("~~", Lte)]);
}

#[test]
fn gte() {
    test(">=", vec![("~~", Gte)]);
}

#[test]
fn neq_both_spellings() {
    test("<>", vec![("~~", Neq)]);
    test("!=", vec![("~~", Neq)]);
}

#[test]
fn negative_num() {
    test("-3", vec![("~ ", Minus), (" ~", Num("3"))]);
}

#[test]
fn arithmetic() {
    test(
        "2 + 3*x",
        vec![
            ("~      ", Num("2")),
            ("  ~    ", Plus),
            ("    ~  ", Num("3")),
            ("     ~ ", Mul),
            ("      ~", Ident("x")),
        ],
    );
}

#[test]
fn scientific_notation() {
    test("1.5e3", vec![("~~~~~", Num("1.5e3"))]);
    test("2E-4", vec![("~~~~", Num("2E-4"))]);
}

#[test]
fn keywords_case_insensitive() {
    test(
        "1 AND 0 Or 1",
        vec![
            ("~           ", Num("1")),
            ("  ~~~       ", And),
            ("      ~     ", Num("0")),
            ("        ~~  ", Or),
            ("           ~", Num("1")),
        ],
    );
}

#[test]
fn parens_and_pow() {
    test(
        "(2^3)",
        vec![
            ("~    ", LParen),
            (" ~   ", Num("2")),
            ("  ~  ", Exp),
            ("   ~ ", Num("3")),
            ("    ~", RParen),
        ],
    );
}

#[test]
fn mod_spellings() {
    test("4 % 2", vec![("~    ", Num("4")), ("  ~  ", Mod), ("    ~", Num("2"))]);
    test(
        "4 mod 2",
        vec![("~      ", Num("4")), ("  ~~~  ", Mod), ("      ~", Num("2"))],
    );
}

#[test]
fn bad_ampersand() {
    test_err("1 &", ("  ~~", UnrecognizedToken));
}

#[test]
fn bad_exponent() {
    test_err("5e", ("~~", ExpectedNumber));
}

#[test]
fn unrecognized_char() {
    test_err("2 #", ("  ~", UnrecognizedToken));
}
