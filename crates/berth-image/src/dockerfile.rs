//! Line-accurate Dockerfile parsing.
//!
//! The parser keeps every physical line verbatim, including its line
//! terminator, and records which lines each instruction spans. A `FROM`
//! rewrite swaps exactly those lines and copies everything else untouched.

use berth_common::error::{BerthError, Result};
use nom::{
    IResult, Parser,
    bytes::complete::{tag, tag_no_case, take_till1},
    character::complete::{alpha1, char, multispace0, multispace1, space0},
    combinator::{eof, opt, recognize},
    multi::many0,
    sequence::{preceded, terminated},
};

const DEFAULT_ESCAPE: char = '\\';

/// One logical instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    /// Upper-cased keyword, e.g. `FROM`.
    pub keyword: String,
    /// Arguments with line continuations joined.
    pub args: String,
    /// First physical line, zero-based.
    pub start_line: usize,
    /// Last physical line, zero-based and inclusive.
    pub end_line: usize,
}

/// The parts of a `FROM` instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FromInstruction {
    /// Options such as `--platform=linux/arm64`, in order.
    pub flags: Vec<String>,
    /// Base image reference as written.
    pub image: String,
    /// Stage name from `AS alias`.
    pub alias: Option<String>,
    /// First physical line, zero-based.
    pub start_line: usize,
    /// Last physical line, zero-based and inclusive.
    pub end_line: usize,
}

/// A parsed Dockerfile that can reproduce its source byte for byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dockerfile {
    lines: Vec<String>,
    instructions: Vec<Instruction>,
    escape: char,
}

fn directive(input: &str) -> IResult<&str, (&str, &str)> {
    let (value, (_, _, key, _, _, _)) =
        (char('#'), space0, alpha1, space0, char('='), space0).parse(input)?;
    Ok(("", (key, value.trim_end())))
}

fn escape_char(value: &str) -> Result<char> {
    match value {
        "\\" => Ok('\\'),
        "`" => Ok('`'),
        other => Err(BerthError::parse(format!("invalid escape directive: {other:?}"))),
    }
}

fn instruction_head(input: &str) -> IResult<&str, &str> {
    preceded(multispace0, alpha1).parse(input)
}

fn word(input: &str) -> IResult<&str, &str> {
    take_till1(|c: char| c.is_whitespace()).parse(input)
}

type FromParts<'a> = (Vec<&'a str>, &'a str, Option<&'a str>);

fn from_parts(input: &str) -> IResult<&str, FromParts<'_>> {
    let (input, _) = multispace0(input)?;
    let (input, flags) =
        many0(terminated(recognize(preceded(tag("--"), word)), multispace0)).parse(input)?;
    let (input, image) = word(input)?;
    let (input, alias) =
        opt(preceded((multispace1, tag_no_case("as"), multispace1), word)).parse(input)?;
    let (input, _) = (multispace0, eof).parse(input)?;
    Ok((input, (flags, image, alias)))
}

fn content(line: &str) -> &str {
    line.trim_end_matches(['\n', '\r'])
}

fn is_trivia(line: &str) -> bool {
    let trimmed = content(line).trim_start();
    trimmed.is_empty() || trimmed.starts_with('#')
}

impl Dockerfile {
    /// Parses Dockerfile source text.
    ///
    /// # Errors
    ///
    /// Returns [`BerthError::Parse`] when a line does not start with an
    /// instruction keyword.
    pub fn parse(source: &str) -> Result<Self> {
        let lines: Vec<String> = source.split_inclusive('\n').map(str::to_string).collect();
        let mut escape = DEFAULT_ESCAPE;
        let mut instructions = Vec::new();
        let mut in_directives = true;
        let mut i = 0;

        while i < lines.len() {
            if in_directives {
                if let Ok((_, (key, value))) = directive(content(&lines[i]).trim_start()) {
                    if key.eq_ignore_ascii_case("escape") {
                        escape = escape_char(value)?;
                    }
                    i += 1;
                    continue;
                }
                in_directives = false;
            }
            if is_trivia(&lines[i]) {
                i += 1;
                continue;
            }

            let start = i;
            let mut end = i;
            let mut logical = String::new();
            loop {
                let body = content(&lines[end]).trim_end();
                if let Some(head) = body.strip_suffix(escape) {
                    logical.push_str(head);
                } else {
                    logical.push_str(body);
                    break;
                }
                let mut next = end + 1;
                while next < lines.len() && is_trivia(&lines[next]) {
                    next += 1;
                }
                if next >= lines.len() {
                    break;
                }
                end = next;
            }

            let (rest, keyword) = instruction_head(&logical).map_err(|_| {
                BerthError::parse(format!(
                    "line {}: expected an instruction: {}",
                    start + 1,
                    content(&lines[start])
                ))
            })?;
            instructions.push(Instruction {
                keyword: keyword.to_ascii_uppercase(),
                args: rest.trim().to_string(),
                start_line: start,
                end_line: end,
            });
            i = end + 1;
        }

        Ok(Self {
            lines,
            instructions,
            escape,
        })
    }

    /// Returns the instructions in source order.
    #[must_use]
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Returns the escape character in effect.
    #[must_use]
    pub const fn escape(&self) -> char {
        self.escape
    }

    /// Reassembles the original source.
    #[must_use]
    pub fn source(&self) -> String {
        self.lines.concat()
    }

    /// Returns the first `FROM` instruction.
    ///
    /// # Errors
    ///
    /// Returns [`BerthError::Parse`] if there is no `FROM` or it is malformed.
    pub fn first_from(&self) -> Result<FromInstruction> {
        let from = self
            .instructions
            .iter()
            .find(|i| i.keyword == "FROM")
            .ok_or_else(|| BerthError::parse("Dockerfile has no FROM instruction"))?;
        let (_, (flags, image, alias)) = from_parts(&from.args).map_err(|_| {
            BerthError::parse(format!("invalid FROM instruction: FROM {}", from.args))
        })?;
        Ok(FromInstruction {
            flags: flags.into_iter().map(str::to_string).collect(),
            image: image.to_string(),
            alias: alias.map(str::to_string),
            start_line: from.start_line,
            end_line: from.end_line,
        })
    }

    /// Produces new source text whose first `FROM` names `image`.
    ///
    /// Flags and the stage alias are kept. The lines the instruction spanned
    /// become one line; every other byte is copied unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`BerthError::Parse`] if there is no valid `FROM`.
    pub fn rewrite_from(&self, image: &str) -> Result<String> {
        let from = self.first_from()?;
        let first = &self.lines[from.start_line];
        let indent_len = first.len() - first.trim_start().len();
        let last = &self.lines[from.end_line];
        let terminator = &last[content(last).len()..];

        let mut line = String::from(&first[..indent_len]);
        line.push_str("FROM ");
        for flag in &from.flags {
            line.push_str(flag);
            line.push(' ');
        }
        line.push_str(image);
        if let Some(alias) = &from.alias {
            line.push_str(" AS ");
            line.push_str(alias);
        }
        line.push_str(terminator);

        let mut out = String::with_capacity(self.source().len() + line.len());
        for (idx, original) in self.lines.iter().enumerate() {
            if idx == from.start_line {
                out.push_str(&line);
            } else if idx < from.start_line || idx > from.end_line {
                out.push_str(original);
            }
        }
        Ok(out)
    }
}
