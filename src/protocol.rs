use crate::auth::{self, AuthAttempt, AuthState, Mechanism};
use crate::reply::Reply;

use std::collections::HashMap;
use std::mem;
use std::net::SocketAddr;
use std::sync::Arc;

use lazy_static::lazy_static;

type Handler = fn(&mut Protocol, Option<&str>) -> Action;

/// Commandes acceptées avant authentification.
const ALLOWED_BEFORE_AUTH: [&str; 6] = ["AUTH", "EHLO", "HELO", "NOOP", "RSET", "QUIT"];

lazy_static! {
    static ref COMMANDS: HashMap<&'static str, Handler> = {
        let mut commands: HashMap<&'static str, Handler> = HashMap::new();
        commands.insert("HELO", Protocol::greeting);
        commands.insert("EHLO", Protocol::greeting);
        commands.insert("AUTH", Protocol::auth);
        commands.insert("MAIL", Protocol::mail);
        commands.insert("RCPT", Protocol::rcpt);
        commands.insert("DATA", Protocol::data);
        commands.insert("RSET", Protocol::rset);
        commands.insert("NOOP", Protocol::noop);
        commands.insert("QUIT", Protocol::quit);
        commands
    };
}

#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// Texte annoncé dans le `220` et le `250-... Hello`.
    pub banner: String,
    /// FQDN utilisé dans les challenges CRAM-MD5.
    pub fqdn: String,
    pub max_message_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    Command,
    Data,
}

/// Message complet, prêt à être remis au puits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub peer: SocketAddr,
    pub mail_from: Option<String>,
    pub recipients: Vec<String>,
    pub data: String,
}

/// Ce que la couche transport doit faire après une ligne.
#[derive(Debug, PartialEq, Eq)]
pub enum Action {
    None,
    Reply(Reply),
    /// Envoyer la réponse puis fermer la connexion.
    Close(Reply),
    /// Valider les identifiants puis appeler `finish_auth`.
    Authenticate(AuthAttempt),
    /// Remettre le message puis appeler `finish_delivery`.
    Deliver(Message),
}

/// Machine à états SMTP d'une connexion, sans entrées/sorties.
#[derive(Debug)]
pub struct Protocol {
    config: Arc<ProtocolConfig>,
    peer: SocketAddr,
    state: CommandState,
    auth: AuthState,
    authenticated: bool,
    greeted: bool,
    sent_challenge: Option<String>,
    mail_from: Option<String>,
    recipients: Vec<String>,
    data: Vec<String>,
    data_size: usize,
    oversized: bool,
}

impl Protocol {
    /// Construit la machine et renvoie la bannière `220`, qui doit être
    /// émise avant toute autre sortie.
    pub fn start(config: Arc<ProtocolConfig>, peer: SocketAddr) -> (Self, Reply) {
        let banner = Reply::new(220, &config.banner);
        let protocol = Protocol {
            config,
            peer,
            state: CommandState::Command,
            auth: AuthState::None,
            authenticated: false,
            greeted: false,
            sent_challenge: None,
            mail_from: None,
            recipients: Vec::new(),
            data: Vec::new(),
            data_size: 0,
            oversized: false,
        };
        (protocol, banner)
    }

    #[cfg(test)]
    pub fn state(&self) -> CommandState {
        self.state
    }

    #[cfg(test)]
    pub fn auth_state(&self) -> &AuthState {
        &self.auth
    }

    #[cfg(test)]
    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn process_line(&mut self, line: &str) -> Action {
        if self.state == CommandState::Data {
            return self.data_line(line);
        }

        if self.auth != AuthState::None {
            return self.auth_continue(line);
        }

        if line.is_empty() {
            return Action::Reply(Reply::new(500, "Error: bad syntax"));
        }

        let (command, arg) = split_command(line);

        if !self.authenticated && !ALLOWED_BEFORE_AUTH.contains(&command.as_str()) {
            return Action::Close(Reply::auth_required());
        }

        match COMMANDS.get(command.as_str()) {
            Some(handler) => handler(self, arg),
            None => Action::Reply(Reply::new(
                502,
                &format!("Error: command \"{}\" not implemented", command),
            )),
        }
    }

    /// Résultat de `Session::try_auth` pour la tentative en cours.
    pub fn finish_auth(&mut self, accepted: bool) -> Action {
        self.auth = AuthState::None;
        if accepted {
            self.authenticated = true;
            Action::Reply(Reply::auth_succeeded())
        } else {
            Action::Close(Reply::auth_failed())
        }
    }

    /// Statut renvoyé par le puits ; `None` vaut `250 Ok`.
    pub fn finish_delivery(&self, status: Option<String>) -> Reply {
        match status {
            Some(status) => Reply::verbatim(&status),
            None => Reply::ok(),
        }
    }

    fn greeting(&mut self, arg: Option<&str>) -> Action {
        let hostname = match arg {
            Some(hostname) => hostname,
            None => return Action::Reply(Reply::new(501, "Syntax: HELO/EHLO hostname")),
        };
        if self.greeted {
            return Action::Reply(Reply::new(503, "Duplicate HELO/EHLO"));
        }
        self.greeted = true;
        Action::Reply(Reply::multi(
            250,
            &[
                format!("{} Hello {}", self.config.banner, hostname),
                "AUTH PLAIN LOGIN CRAM-MD5".to_string(),
                "EHLO".to_string(),
            ],
        ))
    }

    fn auth(&mut self, arg: Option<&str>) -> Action {
        // RFC 4954 : pas de second AUTH après succès
        if self.authenticated {
            return Action::Close(Reply::bad_sequence());
        }
        let arg = match arg {
            Some(arg) => arg,
            None => return Action::Reply(Reply::new(501, "Syntax: AUTH mechanism")),
        };
        let (name, initial) = match arg.split_once(char::is_whitespace) {
            Some((name, rest)) => (name, Some(rest.trim())),
            None => (arg, None),
        };
        let initial = initial.filter(|data| !data.is_empty() && *data != "=");

        match Mechanism::parse(name) {
            None => Action::Reply(Reply::new(504, "Unrecognized authentication type")),
            Some(Mechanism::CramMd5) => {
                let challenge = auth::cram_challenge(&self.config.fqdn);
                let payload = auth::encode(&challenge);
                self.sent_challenge = Some(challenge);
                self.auth = AuthState::AwaitingCramResponse;
                Action::Reply(Reply::continue_auth(&payload))
            }
            Some(Mechanism::Login) => match initial {
                None => {
                    self.auth = AuthState::AwaitingLoginUsername;
                    Action::Reply(Reply::continue_auth(auth::USERNAME_PROMPT))
                }
                Some(data) => self.login_username(data),
            },
            Some(Mechanism::Plain) => match initial {
                None => {
                    self.auth = AuthState::AwaitingPlainResponse;
                    Action::Reply(Reply::continue_auth(""))
                }
                Some(data) => self.plain_response(data),
            },
        }
    }

    fn auth_continue(&mut self, line: &str) -> Action {
        let state = mem::take(&mut self.auth);

        if line.trim() == "*" {
            self.sent_challenge = None;
            return Action::Reply(Reply::new(501, "Authentication cancelled"));
        }

        match state {
            AuthState::None => Action::Reply(Reply::internal_confusion()),
            AuthState::AwaitingCramResponse => {
                let (username, digest) = match auth::decode_cram_response(line) {
                    Ok(response) => response,
                    Err(_) => return self.auth_failed(),
                };
                match self.sent_challenge.take() {
                    Some(challenge) => Action::Authenticate(AuthAttempt::CramMd5 {
                        username,
                        digest,
                        challenge,
                    }),
                    None => Action::Reply(Reply::internal_confusion()),
                }
            }
            AuthState::AwaitingLoginUsername => self.login_username(line),
            AuthState::AwaitingLoginPassword { username } => match auth::decode_text(line) {
                Ok(password) => Action::Authenticate(AuthAttempt::Plaintext { username, password }),
                Err(_) => self.auth_failed(),
            },
            AuthState::AwaitingPlainResponse => self.plain_response(line),
        }
    }

    fn login_username(&mut self, data: &str) -> Action {
        match auth::decode_text(data) {
            Ok(username) => {
                self.auth = AuthState::AwaitingLoginPassword { username };
                Action::Reply(Reply::continue_auth(auth::PASSWORD_PROMPT))
            }
            Err(_) => self.auth_failed(),
        }
    }

    fn plain_response(&mut self, data: &str) -> Action {
        match auth::decode_plain(data) {
            Ok((username, password)) => {
                Action::Authenticate(AuthAttempt::Plaintext { username, password })
            }
            Err(_) => self.auth_failed(),
        }
    }

    fn auth_failed(&mut self) -> Action {
        self.auth = AuthState::None;
        self.sent_challenge = None;
        Action::Close(Reply::auth_failed())
    }

    fn mail(&mut self, arg: Option<&str>) -> Action {
        let address = match parse_path("FROM:", arg) {
            Some(address) => address,
            None => return Action::Reply(Reply::new(501, "Syntax: MAIL FROM:<address>")),
        };
        if self.mail_from.is_some() {
            return Action::Reply(Reply::new(503, "Error: nested MAIL command"));
        }
        self.mail_from = Some(address);
        Action::Reply(Reply::ok())
    }

    fn rcpt(&mut self, arg: Option<&str>) -> Action {
        if self.mail_from.is_none() {
            return Action::Reply(Reply::new(503, "Error: need MAIL command"));
        }
        match parse_path("TO:", arg) {
            Some(address) => {
                self.recipients.push(address);
                Action::Reply(Reply::ok())
            }
            None => Action::Reply(Reply::new(501, "Syntax: RCPT TO: <address>")),
        }
    }

    fn data(&mut self, arg: Option<&str>) -> Action {
        if self.recipients.is_empty() {
            return Action::Reply(Reply::new(503, "Error: need RCPT command"));
        }
        if arg.is_some() {
            return Action::Reply(Reply::new(501, "Syntax: DATA"));
        }
        self.state = CommandState::Data;
        self.data.clear();
        self.data_size = 0;
        self.oversized = false;
        Action::Reply(Reply::new(354, "End data with <CR><LF>.<CR><LF>"))
    }

    fn rset(&mut self, arg: Option<&str>) -> Action {
        if arg.is_some() {
            return Action::Reply(Reply::new(501, "Syntax: RSET"));
        }
        self.reset_transaction();
        Action::Reply(Reply::ok())
    }

    fn noop(&mut self, arg: Option<&str>) -> Action {
        if arg.is_some() {
            return Action::Reply(Reply::new(501, "Syntax: NOOP"));
        }
        Action::Reply(Reply::ok())
    }

    fn quit(&mut self, _arg: Option<&str>) -> Action {
        Action::Close(Reply::bye())
    }

    fn data_line(&mut self, line: &str) -> Action {
        if line == "." {
            return self.end_of_data();
        }
        // Transparence RFC 821 §4.5.2
        let text = line.strip_prefix('.').unwrap_or(line);
        self.data_size += text.len() + 1;
        if self.data_size > self.config.max_message_size {
            // On continue à lire jusqu'au "." pour rester synchronisé
            self.oversized = true;
            self.data.clear();
        } else {
            self.data.push(text.to_string());
        }
        Action::None
    }

    fn end_of_data(&mut self) -> Action {
        self.state = CommandState::Command;
        let data = mem::take(&mut self.data).join("\n");
        let mail_from = self.mail_from.take();
        let recipients = mem::take(&mut self.recipients);

        if mem::replace(&mut self.oversized, false) {
            return Action::Reply(Reply::new(552, "Error: Too much mail data"));
        }

        Action::Deliver(Message {
            peer: self.peer,
            mail_from,
            recipients,
            data,
        })
    }

    fn reset_transaction(&mut self) {
        self.mail_from = None;
        self.recipients.clear();
        self.data.clear();
        self.data_size = 0;
        self.oversized = false;
    }
}

/// Sépare `COMMANDE argument` sur le premier espace.
fn split_command(line: &str) -> (String, Option<&str>) {
    match line.split_once(' ') {
        Some((command, arg)) => {
            let arg = arg.trim();
            (command.to_uppercase(), Some(arg).filter(|arg| !arg.is_empty()))
        }
        None => (line.to_uppercase(), None),
    }
}

/// Extrait l'adresse de `FROM:<addr>` / `TO:<addr>`.
fn parse_path(keyword: &str, arg: Option<&str>) -> Option<String> {
    let arg = arg?;
    let prefix = arg.get(..keyword.len())?;
    if !prefix.eq_ignore_ascii_case(keyword) {
        return None;
    }
    let address = arg[keyword.len()..].split_whitespace().next()?;
    let address = match address.strip_prefix('<').and_then(|a| a.strip_suffix('>')) {
        Some(inner) if !inner.is_empty() => inner,
        _ => address,
    };
    Some(address.to_string())
}
