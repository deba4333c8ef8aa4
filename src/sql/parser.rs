use crate::catalog::MediaKind;
use crate::error::{OmnidexError, OmnidexResult};
use crate::index::IndexKind;
use crate::media::SearchMethod;
use crate::sql::token::{tokenize, Token};

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Str(String),
    Num(String),
}

impl Literal {
    pub fn as_str(&self) -> &str {
        match self {
            Literal::Str(s) | Literal::Num(s) => s,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SpatialParam {
    /// Float second argument: all points within the radius.
    Radius(f64),
    /// Integer second argument: the k nearest points.
    Nearest(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Eq {
        field: String,
        value: Literal,
    },
    Between {
        field: String,
        lo: Literal,
        hi: Literal,
    },
    Spatial {
        field: String,
        point: [f64; 2],
        param: SpatialParam,
    },
    Match {
        field: String,
        query: String,
    },
    Similar {
        field: String,
        path: String,
        method: Option<SearchMethod>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    CreateTable {
        name: String,
        source: String,
        kind: IndexKind,
        fields: Vec<String>,
    },
    CreateMultimediaTable {
        name: String,
        source: String,
        media: MediaKind,
        method: String,
        clusters: usize,
    },
    Select {
        /// `None` is `*`.
        projection: Option<Vec<String>>,
        table: String,
        predicate: Option<Predicate>,
        limit: Option<usize>,
    },
    Insert {
        table: String,
        values: Vec<String>,
    },
    GenerateData {
        table: String,
        count: usize,
    },
    Delete {
        table: String,
        field: String,
        value: Literal,
    },
    DropTable {
        name: String,
    },
}

pub fn parse(sql: &str) -> OmnidexResult<Statement> {
    let tokens = tokenize(sql)?;
    let mut parser = Parser { tokens, pos: 0 };
    let statement = parser.statement()?;
    parser.expect_end()?;
    Ok(statement)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> OmnidexResult<Token> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| OmnidexError::Parse("unexpected end of statement".to_string()))?;
        self.pos += 1;
        Ok(token)
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if let Some(Token::Word(word)) = self.peek() {
            if word.eq_ignore_ascii_case(keyword) {
                self.pos += 1;
                return true;
            }
        }
        false
    }

    fn expect_keyword(&mut self, keyword: &str) -> OmnidexResult<()> {
        if self.eat_keyword(keyword) {
            Ok(())
        } else {
            Err(OmnidexError::Parse(format!(
                "expected keyword {}, found {:?}",
                keyword.to_uppercase(),
                self.peek()
            )))
        }
    }

    fn expect_symbol(&mut self, symbol: char) -> OmnidexResult<()> {
        match self.next()? {
            Token::Symbol(c) if c == symbol => Ok(()),
            other => Err(OmnidexError::Parse(format!(
                "expected '{}', found {:?}",
                symbol, other
            ))),
        }
    }

    fn eat_symbol(&mut self, symbol: char) -> bool {
        if self.peek() == Some(&Token::Symbol(symbol)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn identifier(&mut self) -> OmnidexResult<String> {
        match self.next()? {
            Token::Word(word) => Ok(word.to_ascii_lowercase()),
            other => Err(OmnidexError::Parse(format!(
                "expected identifier, found {:?}",
                other
            ))),
        }
    }

    fn string(&mut self) -> OmnidexResult<String> {
        match self.next()? {
            Token::Str(s) => Ok(s),
            other => Err(OmnidexError::Parse(format!(
                "expected string literal, found {:?}",
                other
            ))),
        }
    }

    fn number(&mut self) -> OmnidexResult<String> {
        match self.next()? {
            Token::Num(n) => Ok(n),
            other => Err(OmnidexError::Parse(format!(
                "expected numeric literal, found {:?}",
                other
            ))),
        }
    }

    fn unsigned(&mut self) -> OmnidexResult<usize> {
        let raw = self.number()?;
        raw.parse::<usize>()
            .map_err(|_| OmnidexError::Parse(format!("\"{}\" is not a positive integer", raw)))
    }

    fn literal(&mut self) -> OmnidexResult<Literal> {
        match self.next()? {
            Token::Str(s) => Ok(Literal::Str(s)),
            Token::Num(n) => Ok(Literal::Num(n)),
            other => Err(OmnidexError::Parse(format!(
                "expected literal, found {:?}",
                other
            ))),
        }
    }

    fn expect_end(&mut self) -> OmnidexResult<()> {
        match self.peek() {
            None => Ok(()),
            Some(token) => Err(OmnidexError::Parse(format!(
                "trailing input after statement: {:?}",
                token
            ))),
        }
    }

    fn statement(&mut self) -> OmnidexResult<Statement> {
        if self.eat_keyword("create") {
            return self.create();
        }
        if self.eat_keyword("select") {
            return self.select();
        }
        if self.eat_keyword("insert") {
            return self.insert();
        }
        if self.eat_keyword("delete") {
            return self.delete();
        }
        if self.eat_keyword("drop") {
            self.expect_keyword("table")?;
            let name = self.identifier()?;
            return Ok(Statement::DropTable { name });
        }
        Err(OmnidexError::Parse(format!(
            "unrecognized statement start: {:?}",
            self.peek()
        )))
    }

    fn create(&mut self) -> OmnidexResult<Statement> {
        let multimedia = self.eat_keyword("multimedia");
        self.expect_keyword("table")?;
        let name = self.identifier()?;
        self.expect_keyword("from")?;
        self.expect_keyword("file")?;
        let source = self.string()?;
        self.expect_keyword("using")?;

        if multimedia {
            let media = match self.identifier()?.as_str() {
                "image" => MediaKind::Image,
                "audio" => MediaKind::Audio,
                other => {
                    return Err(OmnidexError::Parse(format!(
                        "expected image or audio, found \"{}\"",
                        other
                    )))
                }
            };
            self.expect_keyword("with")?;
            self.expect_keyword("method")?;
            let method = self.identifier()?;
            self.expect_keyword("clusters")?;
            let clusters = self.unsigned()?;
            return Ok(Statement::CreateMultimediaTable {
                name,
                source,
                media,
                method,
                clusters,
            });
        }

        self.expect_keyword("index")?;
        let kind: IndexKind = self.identifier()?.parse()?;
        self.expect_symbol('(')?;
        let mut fields = Vec::new();
        loop {
            fields.push(match self.next()? {
                Token::Word(w) => w.to_ascii_lowercase(),
                Token::Str(s) => s.to_ascii_lowercase(),
                other => {
                    return Err(OmnidexError::Parse(format!(
                        "expected field name, found {:?}",
                        other
                    )))
                }
            });
            if !self.eat_symbol(',') {
                break;
            }
        }
        self.expect_symbol(')')?;
        Ok(Statement::CreateTable {
            name,
            source,
            kind,
            fields,
        })
    }

    fn select(&mut self) -> OmnidexResult<Statement> {
        let projection = if self.eat_symbol('*') {
            None
        } else {
            let mut fields = vec![self.identifier()?];
            while self.eat_symbol(',') {
                fields.push(self.identifier()?);
            }
            Some(fields)
        };
        self.expect_keyword("from")?;
        let table = self.identifier()?;
        let predicate = if self.eat_keyword("where") {
            Some(self.predicate()?)
        } else {
            None
        };
        let limit = if self.eat_keyword("limit") {
            Some(self.unsigned()?)
        } else {
            None
        };
        Ok(Statement::Select {
            projection,
            table,
            predicate,
            limit,
        })
    }

    fn predicate(&mut self) -> OmnidexResult<Predicate> {
        let field = self.identifier()?;
        match self.next()? {
            Token::Symbol('=') => Ok(Predicate::Eq {
                field,
                value: self.literal()?,
            }),
            Token::Word(word) if word.eq_ignore_ascii_case("between") => {
                let lo = self.literal()?;
                self.expect_keyword("and")?;
                let hi = self.literal()?;
                Ok(Predicate::Between { field, lo, hi })
            }
            Token::Word(word) if word.eq_ignore_ascii_case("in") => {
                self.expect_symbol('(')?;
                let point_raw = self.string()?;
                self.expect_symbol(',')?;
                let raw = self.number()?;
                self.expect_symbol(')')?;
                let point = parse_point(&point_raw)?;
                let param = if raw.contains('.') {
                    SpatialParam::Radius(raw.parse::<f64>().map_err(|_| {
                        OmnidexError::Parse(format!("\"{}\" is not a radius", raw))
                    })?)
                } else {
                    SpatialParam::Nearest(raw.parse::<usize>().map_err(|_| {
                        OmnidexError::Parse(format!("\"{}\" is not a neighbor count", raw))
                    })?)
                };
                Ok(Predicate::Spatial {
                    field,
                    point,
                    param,
                })
            }
            Token::AtAt => Ok(Predicate::Match {
                field,
                query: self.string()?,
            }),
            Token::Distance => {
                let path = self.string()?;
                let method = if self.eat_keyword("method") {
                    Some(match self.identifier()?.as_str() {
                        "inverted" => SearchMethod::Inverted,
                        "sequential" => SearchMethod::Sequential,
                        other => {
                            return Err(OmnidexError::Parse(format!(
                                "expected inverted or sequential, found \"{}\"",
                                other
                            )))
                        }
                    })
                } else {
                    None
                };
                Ok(Predicate::Similar {
                    field,
                    path,
                    method,
                })
            }
            other => Err(OmnidexError::Parse(format!(
                "unsupported predicate operator {:?}",
                other
            ))),
        }
    }

    fn insert(&mut self) -> OmnidexResult<Statement> {
        self.expect_keyword("into")?;
        let table = self.identifier()?;
        if self.eat_keyword("generate_data") {
            self.expect_symbol('(')?;
            let count = self.unsigned()?;
            self.expect_symbol(')')?;
            return Ok(Statement::GenerateData { table, count });
        }
        self.expect_keyword("values")?;
        self.expect_symbol('(')?;
        let mut values = Vec::new();
        loop {
            values.push(self.literal()?.as_str().to_string());
            if !self.eat_symbol(',') {
                break;
            }
        }
        self.expect_symbol(')')?;
        Ok(Statement::Insert { table, values })
    }

    fn delete(&mut self) -> OmnidexResult<Statement> {
        self.expect_keyword("from")?;
        let table = self.identifier()?;
        self.expect_keyword("where")?;
        let field = self.identifier()?;
        self.expect_symbol('=')?;
        let value = self.literal()?;
        Ok(Statement::Delete {
            table,
            field,
            value,
        })
    }
}

/// Parse a `"lat,lon"` coordinate pair.
pub fn parse_point(raw: &str) -> OmnidexResult<[f64; 2]> {
    let mut parts = raw.split(',');
    let parse = |part: Option<&str>| -> OmnidexResult<f64> {
        part.map(str::trim)
            .and_then(|p| p.parse::<f64>().ok())
            .ok_or_else(|| {
                OmnidexError::Parse(format!("\"{}\" is not a \"lat,lon\" pair", raw))
            })
    };
    let lat = parse(parts.next())?;
    let lon = parse(parts.next())?;
    if parts.next().is_some() {
        return Err(OmnidexError::Parse(format!(
            "\"{}\" is not a \"lat,lon\" pair",
            raw
        )));
    }
    Ok([lat, lon])
}
