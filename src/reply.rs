use std::fmt;

/// Réponse SMTP, éventuellement multi-lignes (`250-...` puis `250 ...`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    lines: Vec<String>,
}

impl fmt::Display for Reply {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        for line in &self.lines {
            fmt.write_fmt(format_args!("{}\r\n", line))?;
        }
        Ok(())
    }
}

impl Reply {
    pub fn new(code: u16, text: &str) -> Self {
        Reply {
            lines: vec![format!("{} {}", code, text)],
        }
    }

    pub fn multi(code: u16, texts: &[String]) -> Self {
        let len = texts.len();
        let lines = texts
            .iter()
            .enumerate()
            .map(|(idx, text)| {
                let sep = if idx + 1 == len { ' ' } else { '-' };
                format!("{}{}{}", code, sep, text)
            })
            .collect();
        Reply { lines }
    }

    /// Ligne fournie telle quelle (statut renvoyé par le puits de messages).
    pub fn verbatim(line: &str) -> Self {
        Reply {
            lines: vec![line.trim_end_matches(['\r', '\n']).to_string()],
        }
    }

    pub fn ok() -> Self {
        Reply::new(250, "Ok")
    }

    pub fn bye() -> Self {
        Reply::new(221, "Bye")
    }

    pub fn auth_required() -> Self {
        Reply::new(530, "Authentication required")
    }

    pub fn auth_succeeded() -> Self {
        Reply::new(235, "Authentication Successful")
    }

    pub fn auth_failed() -> Self {
        Reply::new(535, "authentication failed")
    }

    pub fn bad_sequence() -> Self {
        Reply::new(503, "Bad sequence of commands")
    }

    pub fn internal_confusion() -> Self {
        Reply::new(451, "Internal confusion")
    }

    pub fn continue_auth(payload: &str) -> Self {
        Reply::new(334, payload)
    }

    /// Lignes telles qu'émises sur le fil, sans CRLF.
    pub fn lines(&self) -> &[String] {
        &self.lines
    }
}
