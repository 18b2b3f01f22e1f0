//! Makefile-style depfile parsing.
//!
//! A depfile describes what files a generated file transitively depends on,
//! in the `target: dep dep…` syntax produced for example by the `-MF` option
//! of gcc and clang:
//!
//! ```text
//! foo.o: foo.cpp \
//!   some_header.h \
//!   another_header.h
//! ```
//!
//! Backslashes escape anything, including the syntax characters. Escaping a
//! space inside a file path takes two backslashes (`path\\ with\\ spaces`):
//! the first level turns `\<LF>` into plain whitespace, the second protects
//! the character from being treated as a token separator.

use std::fs;
use std::io;

use thiserror::Error;

use crate::io::{BlockCharReader, CharReader};

/// A single `target: deps…` record. Only one record per depfile is accepted
/// for now; the target is expected to be the file being updated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DepfileData {
    pub target_path: String,
    pub dependency_paths: Vec<String>,
}

#[derive(Debug, Error)]
pub enum Error {
    /// Some unexpected character was read, or the depfile uses an
    /// unsupported feature such as several records.
    #[error("invalid depfile: {0}")]
    Parse(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, PartialEq, Eq)]
enum Token {
    String(String),
    Colon,
    NewLine,
    End,
}

/// Transforms the character stream into tokens. We have to look one
/// character ahead to know when a token ends; for example a string token is
/// over once the next significant character is a space.
struct Tokenizer<R: CharReader> {
    char_reader: R,
    current: Option<u8>,
}

impl<R: CharReader> Tokenizer<R> {
    fn new(char_reader: R) -> Result<Tokenizer<R>, Error> {
        let mut tokenizer = Tokenizer { char_reader, current: None };
        tokenizer.read()?;
        Ok(tokenizer)
    }

    fn next_token(&mut self) -> Result<Token, Error> {
        while let Some(c) = self.current {
            if c != b' ' && c != b'\t' {
                break;
            }
            self.read()?;
        }
        let c = match self.current {
            None => return Ok(Token::End),
            Some(c) => c,
        };
        if c == b':' {
            self.read()?;
            return Ok(Token::Colon);
        }
        if c == b'\n' {
            self.read()?;
            return Ok(Token::NewLine);
        }
        let mut bytes: Vec<u8> = Vec::new();
        while let Some(c) = self.current {
            if c == b' ' || c == b'\t' || c == b':' || c == b'\n' {
                break;
            }
            let c = if c == b'\\' {
                self.read()?;
                self.current.unwrap_or(b'\\')
            } else {
                c
            };
            bytes.push(c);
            if self.current.is_none() {
                break;
            }
            self.read()?;
        }
        Ok(Token::String(String::from_utf8_lossy(&bytes).into_owned()))
    }

    /// Read one significant character: `\x` collapses to `x`, and `\<LF>`
    /// to plain whitespace.
    fn read(&mut self) -> Result<(), Error> {
        self.current = self.char_reader.next_byte()?;
        if self.current != Some(b'\\') {
            return Ok(());
        }
        self.current = self.char_reader.next_byte()?;
        match self.current {
            None => Err(Error::Parse("expected character after escape sequence `\\`".to_string())),
            Some(b'\n') => {
                self.current = Some(b' ');
                Ok(())
            }
            Some(_) => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    ReadTarget,
    ReadColon,
    ReadDep,
    Done,
}

/// Parse a depfile character stream into its record, or `None` for an
/// all-whitespace stream.
pub fn parse<R: CharReader>(char_reader: R) -> Result<Option<DepfileData>, Error> {
    let mut tokenizer = Tokenizer::new(char_reader)?;
    let mut data: Option<DepfileData> = None;
    let mut state = State::ReadTarget;
    loop {
        match tokenizer.next_token()? {
            Token::End => {
                if !(state == State::ReadTarget
                    || state == State::ReadDep
                    || state == State::Done)
                {
                    return Err(Error::Parse("unexpected end".to_string()));
                }
                return Ok(data);
            }
            Token::Colon => {
                if state != State::ReadColon {
                    return Err(Error::Parse("unexpected colon operator".to_string()));
                }
                state = State::ReadDep;
            }
            Token::NewLine => {
                if state == State::ReadTarget {
                    continue;
                }
                if state != State::ReadDep {
                    return Err(Error::Parse("unexpected newline".to_string()));
                }
                state = State::Done;
            }
            Token::String(value) => match state {
                State::ReadTarget => {
                    data = Some(DepfileData { target_path: value, ..Default::default() });
                    state = State::ReadColon;
                }
                State::ReadDep => {
                    data.as_mut().expect("depfile record must exist").dependency_paths.push(value);
                }
                _ => {
                    return Err(Error::Parse(format!("unexpected string `{}`", value)));
                }
            },
        }
    }
}

/// Read and parse the depfile at `path`. When the path is a FIFO, this
/// blocks until a writer opens it, then until all writers are gone.
pub fn read(path: &str) -> Result<Option<DepfileData>, Error> {
    let file = fs::File::open(path)?;
    parse(BlockCharReader::new(file))
}
