//! Parsing of Makefile syntax as found in `.d` files emitted by C compilers.
//!
//! Compilers escape creatively, so the backslash rules are load-bearing:
//! 2N+1 backslashes before a space collapse to N backslashes plus a literal
//! space inside the path; 2N backslashes before a space stay as-is and the
//! space ends the path; `\#` drops the backslash; `$$` means `$`; any other
//! backslash run is preserved verbatim.

use crate::scanner::{ParseResult, Scanner};

#[derive(Debug, Default, PartialEq)]
pub struct Depfile {
    /// The output path the rule claims to describe.
    pub target: Option<String>,
    pub deps: Vec<String>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DepfileOptions {
    /// Reject depfiles whose rules name distinct targets on separate lines
    /// rather than keeping the first.
    pub distinct_target_lines_error: bool,
}

#[derive(PartialEq)]
enum Sep {
    Space,
    Colon,
    Newline,
    Eof,
}

/// Read one (de-escaped) path, returning it along with what ended it.
/// A ':' only acts as a separator when trailed by whitespace or EOF, so
/// Windows drive letters survive.
fn read_path(s: &mut Scanner) -> ParseResult<(String, Sep)> {
    let mut path = String::new();
    let sep = loop {
        match s.peek() {
            '\0' => break Sep::Eof,
            ' ' | '\t' => {
                s.next();
                break Sep::Space;
            }
            '\n' => {
                s.next();
                break Sep::Newline;
            }
            '\r' => {
                s.next();
                if !s.skip('\n') {
                    return s.parse_error("stray carriage return");
                }
                break Sep::Newline;
            }
            ':' => {
                if matches!(s.peek_at(1), ' ' | '\t' | '\r' | '\n' | '\0') {
                    s.next();
                    break Sep::Colon;
                }
                path.push(':');
                s.next();
            }
            '$' => {
                s.next();
                // "$$" is an escaped dollar; a lone "$" passes through.
                s.skip('$');
                path.push('$');
            }
            '\\' => {
                let mut run = 0;
                while s.peek_at(run) == '\\' {
                    run += 1;
                }
                match s.peek_at(run) {
                    ' ' if run % 2 == 1 => {
                        // 2N+1 backslashes + space: N backslashes, escaped space.
                        for _ in 0..run / 2 {
                            path.push('\\');
                        }
                        path.push(' ');
                        for _ in 0..run + 1 {
                            s.next();
                        }
                    }
                    ' ' => {
                        // 2N backslashes + space: all kept, space ends the path.
                        for _ in 0..run {
                            path.push('\\');
                            s.next();
                        }
                        s.next();
                        break Sep::Space;
                    }
                    '#' => {
                        // One backslash escapes the hash; the rest survive.
                        for _ in 0..run - 1 {
                            path.push('\\');
                        }
                        path.push('#');
                        for _ in 0..run + 1 {
                            s.next();
                        }
                    }
                    '\n' | '\r' => {
                        // Line continuation; the path ends here but the
                        // logical line does not.
                        for _ in 0..run - 1 {
                            path.push('\\');
                        }
                        for _ in 0..run {
                            s.next();
                        }
                        if s.skip('\r') {
                            if !s.skip('\n') {
                                return s.parse_error("stray carriage return");
                            }
                        } else {
                            s.skip('\n');
                        }
                        break Sep::Space;
                    }
                    _ => {
                        // Backslashes before anything else pass through.
                        for _ in 0..run {
                            path.push('\\');
                            s.next();
                        }
                    }
                }
            }
            c => {
                path.push(c);
                s.next();
            }
        }
    };
    Ok((path, sep))
}

/// Parse the contents of a `.d` file.
pub fn parse(s: &mut Scanner, options: DepfileOptions) -> ParseResult<Depfile> {
    let mut depfile = Depfile::default();
    let mut parsing_targets = true;
    // Set when a path previously seen as an input shows up as a target;
    // real inputs may not have inputs of their own.
    let mut poisoned_input = false;
    let mut have_target = false;
    let mut logical_line = 0usize;
    let mut target_line = 0usize;

    loop {
        while matches!(s.peek(), ' ' | '\t') {
            s.next();
        }
        if s.peek() == '\0' {
            break;
        }
        let (path, sep) = read_path(s)?;
        let is_dependency = !parsing_targets;
        if sep == Sep::Colon {
            parsing_targets = false;
            have_target = true;
        }

        if !path.is_empty() {
            if depfile.deps.contains(&path) {
                if !is_dependency {
                    poisoned_input = true;
                }
            } else if is_dependency {
                if poisoned_input {
                    return s.parse_error("inputs may not also have inputs");
                }
                depfile.deps.push(path);
            } else {
                match &depfile.target {
                    None => {
                        depfile.target = Some(path);
                        target_line = logical_line;
                    }
                    Some(t) if *t == path => {}
                    Some(_) => {
                        if logical_line == target_line {
                            return s.parse_error("depfile has multiple output paths");
                        }
                        if options.distinct_target_lines_error {
                            return s.parse_error(
                                "depfile has multiple output paths (on separate lines)",
                            );
                        }
                        // Keep the first and ignore the rest.
                    }
                }
            }
        }

        match sep {
            Sep::Newline => {
                parsing_targets = true;
                poisoned_input = false;
                logical_line += 1;
            }
            Sep::Eof => break,
            _ => {}
        }
    }

    if !have_target {
        return s.parse_error("expected ':' in depfile");
    }
    Ok(depfile)
}
