use crate::model::FlatNote;
use crate::{Error, LibraryError, ParseErrorKind};
use indexmap::IndexMap;
use miette::SourceSpan;
use unscanny::Scanner;

/// ASCII control characters rejected everywhere in a note file.
const FORBIDDEN: [char; 5] = ['\u{0}', '\u{7}', '\u{8}', '\u{B}', '\u{C}'];

/// Characters rejected in tags on top of [`FORBIDDEN`] and `"`.
const TAG_FORBIDDEN: [char; 2] = [' ', '\u{3000}'];

struct NoteParser<'a> {
    s: Scanner<'a>,
    /// The most recently consumed terminal, reported as error context.
    context: Option<String>,
}

impl<'a> NoteParser<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            s: Scanner::new(text),
            context: None,
        }
    }

    fn line_col(&self, offset: usize) -> (usize, usize) {
        let src = self.s.string();
        let offset = offset.min(src.len());
        let before = &src[..offset];
        let line = before.matches('\n').count() + 1;
        let line_start = before.rfind('\n').map_or(0, |p| p + 1);
        let column = before[line_start..].chars().count() + 1;
        (line, column)
    }

    /// The text from `from` through the end of its line, newline included.
    fn rest_of_line(&self, from: usize) -> String {
        let src = self.s.string();
        match src[from..].find('\n') {
            Some(i) => src[from..=from + i].to_string(),
            None => src[from..].to_string(),
        }
    }

    fn unexpected(&self, offset: usize, token: impl Into<String>, expected: &[&str]) -> Error {
        let token = token.into();
        let src = self.s.string();
        let end = (offset + token.len()).min(src.len());
        let (line, column) = self.line_col(offset);
        Error::Library(LibraryError::Parse(ParseErrorKind::UnexpectedToken {
            line,
            column,
            token,
            expected: expected.iter().map(|e| (*e).to_string()).collect(),
            context: self.context.clone(),
            src: src.to_string(),
            at: SourceSpan::from(offset.min(src.len())..end),
        }))
    }

    fn forbidden(&self, offset: usize, character: char) -> Error {
        let (line, column) = self.line_col(offset);
        Error::Library(LibraryError::Parse(ParseErrorKind::ForbiddenCharacter {
            line,
            column,
            character,
            src: self.s.string().to_string(),
            at: SourceSpan::from(offset..offset + character.len_utf8()),
        }))
    }

    fn skip_blank_lines(&mut self) {
        while self.s.eat_if('\n') {
            self.context = Some("\n".to_string());
        }
    }

    /// Read characters up to the end of the line, rejecting `FORBIDDEN` and
    /// `"`. The terminating newline is not consumed.
    fn read_name_chars(&mut self) -> Result<String, Error> {
        let mut value = String::new();
        while let Some(ch) = self.s.peek() {
            if ch == '\n' {
                break;
            }
            if FORBIDDEN.contains(&ch) || ch == '"' {
                return Err(self.forbidden(self.s.cursor(), ch));
            }
            self.s.eat();
            value.push(ch);
        }
        Ok(value)
    }

    fn expect_newline(&mut self) -> Result<(), Error> {
        if self.s.eat_if('\n') {
            return Ok(());
        }
        let at = self.s.cursor();
        Err(self.unexpected(at, self.rest_of_line(at), &["NEWLINE"]))
    }

    fn parse_title(&mut self) -> Result<String, Error> {
        let start = self.s.cursor();
        let hashes = self.s.eat_while('#');
        match hashes.len() {
            2 => {
                if !self.s.eat_if(' ') {
                    let at = self.s.cursor();
                    return Err(self.unexpected(at, self.rest_of_line(at), &["TITLENAME"]));
                }
                self.context = Some("##".to_string());
                let vstart = self.s.cursor();
                let title = self.read_name_chars()?;
                if title.trim().is_empty() {
                    let at = self.s.cursor();
                    return Err(self.unexpected(at, self.rest_of_line(at), &["TITLENAME"]));
                }
                let _ = vstart;
                self.expect_newline()?;
                self.context = Some(format!("{}\n", title));
                Ok(title)
            }
            0 | 1 => Err(self.unexpected(start, self.rest_of_line(start), &["TITLEHEADER"])),
            _ => Err(self.unexpected(start, hashes.to_string(), &["TITLEHEADER"])),
        }
    }

    fn parse_nid(&mut self) -> Result<i64, Error> {
        let start = self.s.cursor();
        if !self.s.eat_if("nid: ") {
            return Err(self.unexpected(start, self.rest_of_line(start), &["NID"]));
        }
        let dstart = self.s.cursor();
        let digits = self.s.eat_while(|c: char| c.is_ascii_digit());
        if digits.is_empty() {
            return Err(self.unexpected(dstart, self.rest_of_line(dstart), &["INT"]));
        }
        let nid: i64 = digits
            .parse()
            .map_err(|_| self.unexpected(dstart, digits.to_string(), &["INT"]))?;
        self.expect_newline()?;
        self.context = Some(format!("nid: {}\n", nid));
        Ok(nid)
    }

    /// Parse a `label: value` line where the value is a name (model, deck).
    fn parse_labeled(&mut self, label: &str, terminal: &str) -> Result<String, Error> {
        let start = self.s.cursor();
        if !self.s.eat_if(label) {
            return Err(self.unexpected(start, self.rest_of_line(start), &[terminal]));
        }
        let value = self.read_name_chars()?;
        if value.trim().is_empty() {
            let at = self.s.cursor();
            return Err(self.unexpected(at, self.rest_of_line(at), &[terminal]));
        }
        self.expect_newline()?;
        self.context = Some(format!("{}{}\n", label, value));
        Ok(value)
    }

    fn parse_tags(&mut self) -> Result<Vec<String>, Error> {
        let start = self.s.cursor();
        if !self.s.eat_if("tags:") {
            return Err(self.unexpected(start, self.rest_of_line(start), &["TAGS"]));
        }
        let mut tags = Vec::new();
        if self.s.eat_if('\n') {
            self.context = Some("tags:\n".to_string());
            return Ok(tags);
        }
        if !self.s.eat_if(' ') {
            let at = self.s.cursor();
            return Err(self.unexpected(at, self.rest_of_line(at), &["TAG"]));
        }
        loop {
            let tstart = self.s.cursor();
            let mut tag = String::new();
            while let Some(ch) = self.s.peek() {
                if ch == ',' || ch == '\n' {
                    break;
                }
                if FORBIDDEN.contains(&ch) || TAG_FORBIDDEN.contains(&ch) || ch == '"' {
                    return Err(self.forbidden(self.s.cursor(), ch));
                }
                self.s.eat();
                tag.push(ch);
            }
            if tag.is_empty() {
                let token = self.s.peek().map_or(String::new(), |c| c.to_string());
                return Err(self.unexpected(tstart, token, &["TAG"]));
            }
            tags.push(tag);
            if self.s.eat_if(',') {
                self.s.eat_if(' ');
                continue;
            }
            self.expect_newline()?;
            break;
        }
        self.context = Some(self.s.from(start).to_string());
        Ok(tags)
    }

    fn parse_markdown(&mut self) -> Result<bool, Error> {
        let start = self.s.cursor();
        if !self.s.eat_if("markdown: ") {
            return Err(self.unexpected(start, self.rest_of_line(start), &["MARKDOWN"]));
        }
        let value = if self.s.eat_if("true") {
            true
        } else if self.s.eat_if("false") {
            false
        } else {
            let at = self.s.cursor();
            return Err(self.unexpected(at, self.rest_of_line(at), &["MARKDOWN"]));
        };
        self.expect_newline()?;
        self.context = Some(format!("markdown: {}\n", value));
        Ok(value)
    }

    fn expect_blank_line(&mut self) -> Result<(), Error> {
        if self.s.eat_if('\n') {
            if let Some(context) = self.context.as_mut() {
                context.push('\n');
            }
            return Ok(());
        }
        let at = self.s.cursor();
        Err(self.unexpected(at, self.rest_of_line(at), &["NEWLINE"]))
    }

    fn parse_field_header(&mut self) -> Result<String, Error> {
        let start = self.s.cursor();
        let hashes = self.s.eat_while('#');
        if hashes.len() != 3 || !self.s.eat_if(' ') {
            let token = if hashes.len() >= 2 {
                "##".to_string()
            } else {
                self.rest_of_line(start)
            };
            return Err(self.unexpected(start, token, &["FIELDHEADER"]));
        }
        let name = self.read_name_chars()?;
        let trimmed = name.trim();
        if trimmed.is_empty() {
            let at = self.s.cursor();
            let token = if self.s.done() {
                String::new()
            } else {
                "\n".to_string()
            };
            return Err(self.unexpected(at, token, &["FIELDNAME"]));
        }
        if trimmed.starts_with(['#', '/', '^']) {
            let offset = start + hashes.len() + 1;
            return Err(self.unexpected(offset, name, &["FIELDNAME"]));
        }
        self.expect_newline()?;
        self.context = Some(format!("### {}\n", trimmed));
        Ok(trimmed.to_string())
    }

    fn parse_field_body(&mut self) -> Result<String, Error> {
        let mut lines: Vec<&str> = Vec::new();
        while !self.s.done() && !self.s.at("### ") {
            let lstart = self.s.cursor();
            while let Some(ch) = self.s.peek() {
                if ch == '\n' {
                    break;
                }
                if FORBIDDEN.contains(&ch) {
                    return Err(self.forbidden(self.s.cursor(), ch));
                }
                self.s.eat();
            }
            lines.push(self.s.from(lstart));
            self.s.eat_if('\n');
        }
        // The emitter terminates every field block with a blank separator
        // line; strip it (and any stray trailing blanks) back off.
        while lines.last().is_some_and(|l| l.is_empty()) {
            lines.pop();
        }
        Ok(lines.join("\n"))
    }

    fn parse_fields(&mut self) -> Result<IndexMap<String, String>, Error> {
        let mut fields = IndexMap::new();
        if self.s.done() {
            let at = self.s.cursor();
            return Err(self.unexpected(at, String::new(), &["FIELDHEADER"]));
        }
        while !self.s.done() {
            let name = self.parse_field_header()?;
            let body = self.parse_field_body()?;
            fields.insert(name, body);
        }
        Ok(fields)
    }
}

/// Parse a note file into its [`FlatNote`] form.
pub fn parse_note(text: &str) -> Result<FlatNote, Error> {
    let mut p = NoteParser::new(text);
    p.skip_blank_lines();
    let title = p.parse_title()?;
    let nid = p.parse_nid()?;
    let model = p.parse_labeled("model: ", "MODEL")?;
    let deck = p.parse_labeled("deck: ", "DECK")?;
    let tags = p.parse_tags()?;
    let markdown = p.parse_markdown()?;
    p.expect_blank_line()?;
    let fields = p.parse_fields()?;
    Ok(FlatNote {
        title,
        nid,
        model,
        deck,
        tags,
        markdown,
        fields,
    })
}
