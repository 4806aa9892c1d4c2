//! Minimal XML element scanner.
//!
//! Just enough XML to check well-formedness, to find elements with their
//! paths and text, and to cut elements out of a document. No namespaces,
//! no DTD processing; attributes are checked but not reported.

use std::ops::Range;

use thiserror::Error;

/// Well-formedness violation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} at byte {offset}")]
pub struct XmlError {
    pub message: String,
    pub offset: usize,
}

impl XmlError {
    fn new(message: impl Into<String>, offset: usize) -> Self {
        Self {
            message: message.into(),
            offset,
        }
    }
}

/// One element of a scanned document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub name: String,
    /// Absolute element path, e.g. `/PLAY/ACT/SCENE`.
    pub path: String,
    /// Position in document order, starting at 0 for the root.
    pub ordinal: u32,
    /// Text of the element and all its descendants.
    pub text: String,
    /// Bytes from the start of the open tag to the end of the close tag.
    pub span: Range<usize>,
}

struct Open {
    index: usize,
    text: String,
}

/// Scan a document, returning its elements in document order.
pub fn scan(input: &str) -> Result<Vec<Element>, XmlError> {
    let mut scanner = Scanner {
        input,
        pos: 0,
        elements: Vec::new(),
        stack: Vec::new(),
        root_closed: false,
    };
    scanner.run()?;
    Ok(scanner.elements)
}

/// Remove every `element` whose text contains `containing` (or every one, if
/// `None`). Returns the new document and how many elements were removed.
pub fn remove_elements(
    input: &str,
    element: &str,
    containing: Option<&str>,
) -> Result<(String, usize), XmlError> {
    let elements = scan(input)?;
    let mut cut: Vec<Range<usize>> = Vec::new();

    for el in elements.iter().filter(|e| e.name == element) {
        if containing.map_or(false, |needle| !el.text.contains(needle)) {
            continue;
        }
        if cut.last().map_or(false, |last| el.span.start < last.end) {
            // nested inside an element already removed
            continue;
        }
        if el.ordinal == 0 {
            return Err(XmlError::new("cannot remove the root element", el.span.start));
        }
        cut.push(el.span.clone());
    }

    let mut out = String::with_capacity(input.len());
    let mut last = 0;
    for range in &cut {
        out.push_str(&input[last..range.start]);
        last = range.end;
    }
    out.push_str(&input[last..]);
    Ok((out, cut.len()))
}

/// Lowercase alphanumeric tokens of `text`.
pub fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
}

struct Scanner<'a> {
    input: &'a str,
    pos: usize,
    elements: Vec<Element>,
    stack: Vec<Open>,
    root_closed: bool,
}

impl<'a> Scanner<'a> {
    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn err(&self, message: impl Into<String>) -> XmlError {
        XmlError::new(message, self.pos)
    }

    fn run(&mut self) -> Result<(), XmlError> {
        if self.rest().starts_with('\u{feff}') {
            self.pos += '\u{feff}'.len_utf8();
        }

        while self.pos < self.input.len() {
            let rest = self.rest();
            if rest.starts_with("<?") {
                self.skip_past("?>", "unterminated processing instruction")?;
            } else if rest.starts_with("<!--") {
                self.skip_past("-->", "unterminated comment")?;
            } else if rest.starts_with("<![CDATA[") {
                let start = self.pos + "<![CDATA[".len();
                self.skip_past("]]>", "unterminated CDATA section")?;
                let data = &self.input[start..self.pos - "]]>".len()];
                self.text(data.to_string())?;
            } else if rest.starts_with("<!") {
                self.skip_declaration()?;
            } else if rest.starts_with("</") {
                self.close_tag()?;
            } else if rest.starts_with('<') {
                self.open_tag()?;
            } else {
                self.char_data()?;
            }
        }

        if let Some(open) = self.stack.last() {
            return Err(self.err(format!("unclosed element <{}>", self.elements[open.index].name)));
        }
        if self.elements.is_empty() {
            return Err(self.err("no root element"));
        }
        Ok(())
    }

    fn skip_past(&mut self, end: &str, message: &str) -> Result<(), XmlError> {
        match self.rest().find(end) {
            Some(idx) => {
                self.pos += idx + end.len();
                Ok(())
            }
            None => Err(self.err(message)),
        }
    }

    /// `<!DOCTYPE ...>`, including an internal subset in brackets.
    fn skip_declaration(&mut self) -> Result<(), XmlError> {
        let mut depth = 0usize;
        for (idx, c) in self.rest().char_indices() {
            match c {
                '[' => depth += 1,
                ']' => depth = depth.saturating_sub(1),
                '>' if depth == 0 => {
                    self.pos += idx + 1;
                    return Ok(());
                }
                _ => {}
            }
        }
        Err(self.err("unterminated declaration"))
    }

    fn name(&mut self) -> Result<&'a str, XmlError> {
        let rest = self.rest();
        let mut end = 0;
        for (idx, c) in rest.char_indices() {
            let ok = if idx == 0 {
                c.is_alphabetic() || c == '_' || c == ':'
            } else {
                c.is_alphanumeric() || matches!(c, '_' | ':' | '-' | '.')
            };
            if !ok {
                break;
            }
            end = idx + c.len_utf8();
        }
        if end == 0 {
            return Err(self.err("expected a name"));
        }
        self.pos += end;
        Ok(&rest[..end])
    }

    fn skip_whitespace(&mut self) {
        let rest = self.rest();
        let trimmed = rest.trim_start_matches(|c: char| c.is_ascii_whitespace());
        self.pos += rest.len() - trimmed.len();
    }

    fn open_tag(&mut self) -> Result<(), XmlError> {
        let start = self.pos;
        if self.root_closed {
            return Err(self.err("more than one root element"));
        }
        self.pos += 1;
        let name = self.name()?;

        loop {
            let had_space = self.rest().starts_with(|c: char| c.is_ascii_whitespace());
            self.skip_whitespace();
            let rest = self.rest();
            if rest.starts_with("/>") {
                self.pos += 2;
                let index = self.push_element(name, start);
                self.finish_element(index, String::new());
                return Ok(());
            }
            if rest.starts_with('>') {
                self.pos += 1;
                let index = self.push_element(name, start);
                self.stack.push(Open {
                    index,
                    text: String::new(),
                });
                return Ok(());
            }
            if rest.is_empty() {
                return Err(self.err(format!("unterminated tag <{}>", name)));
            }
            if !had_space {
                return Err(self.err("expected whitespace before attribute"));
            }
            self.attribute()?;
        }
    }

    fn attribute(&mut self) -> Result<(), XmlError> {
        self.name()?;
        self.skip_whitespace();
        if !self.rest().starts_with('=') {
            return Err(self.err("expected '=' after attribute name"));
        }
        self.pos += 1;
        self.skip_whitespace();

        let quote = match self.rest().chars().next() {
            Some(q @ ('"' | '\'')) => q,
            _ => return Err(self.err("expected quoted attribute value")),
        };
        self.pos += 1;
        let rest = self.rest();
        let end = rest
            .find(quote)
            .ok_or_else(|| self.err("unterminated attribute value"))?;
        let value = &rest[..end];
        if value.contains('<') {
            return Err(self.err("'<' in attribute value"));
        }
        decode(value, self.pos)?;
        self.pos += end + 1;
        Ok(())
    }

    fn close_tag(&mut self) -> Result<(), XmlError> {
        self.pos += 2;
        let name = self.name()?;
        self.skip_whitespace();
        if !self.rest().starts_with('>') {
            return Err(self.err(format!("malformed close tag </{}", name)));
        }
        self.pos += 1;

        let open = self
            .stack
            .pop()
            .ok_or_else(|| self.err(format!("unexpected close tag </{}>", name)))?;
        let expected = &self.elements[open.index].name;
        if expected != name {
            return Err(self.err(format!("mismatched close tag: expected </{}>, found </{}>", expected, name)));
        }
        self.finish_element(open.index, open.text);
        Ok(())
    }

    fn char_data(&mut self) -> Result<(), XmlError> {
        let rest = self.rest();
        let end = rest.find('<').unwrap_or(rest.len());
        let raw = &rest[..end];
        let decoded = decode(raw, self.pos)?;
        self.pos += end;
        self.text(decoded)
    }

    fn text(&mut self, text: String) -> Result<(), XmlError> {
        match self.stack.last_mut() {
            Some(open) => {
                open.text.push_str(&text);
                Ok(())
            }
            None if text.trim().is_empty() => Ok(()),
            None => Err(self.err("text outside the root element")),
        }
    }

    fn push_element(&mut self, name: &str, start: usize) -> usize {
        let parent_path = self
            .stack
            .last()
            .map(|open| self.elements[open.index].path.as_str())
            .unwrap_or("");
        let path = format!("{}/{}", parent_path, name);
        let index = self.elements.len();
        self.elements.push(Element {
            name: name.to_string(),
            path,
            ordinal: index as u32,
            text: String::new(),
            span: start..start,
        });
        index
    }

    fn finish_element(&mut self, index: usize, text: String) {
        if let Some(parent) = self.stack.last_mut() {
            if !parent.text.is_empty() && !text.is_empty() {
                parent.text.push(' ');
            }
            parent.text.push_str(&text);
        } else {
            self.root_closed = true;
        }
        let element = &mut self.elements[index];
        element.text = text;
        element.span.end = self.pos;
    }
}

/// Expand entity and character references.
fn decode(raw: &str, offset: usize) -> Result<String, XmlError> {
    if !raw.contains('&') {
        return Ok(raw.to_string());
    }

    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(idx) = rest.find('&') {
        out.push_str(&rest[..idx]);
        let after = &rest[idx + 1..];
        let end = after
            .find(';')
            .ok_or_else(|| XmlError::new("unterminated entity reference", offset + idx))?;
        let entity = &after[..end];
        let c = match entity {
            "lt" => '<',
            "gt" => '>',
            "amp" => '&',
            "quot" => '"',
            "apos" => '\'',
            _ => {
                let code = if let Some(hex) = entity.strip_prefix("#x") {
                    u32::from_str_radix(hex, 16).ok()
                } else if let Some(dec) = entity.strip_prefix('#') {
                    dec.parse::<u32>().ok()
                } else {
                    None
                };
                code.and_then(char::from_u32).ok_or_else(|| {
                    XmlError::new(format!("unknown entity &{};", entity), offset + idx)
                })?
            }
        };
        out.push(c);
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}
