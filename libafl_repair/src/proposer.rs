//! Patch proposals: the completion endpoint and the parser for its answers.

use core::{fmt, time::Duration};
use std::env;

use serde::{Deserialize, Serialize};

use crate::{target::Language, Error};

/// Default system prompt for the repair conversation
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are an expert C and C++ programmer. \
You fix memory-safety and logic bugs that make programs crash, without changing their intended behavior. \
Always answer with the complete corrected program in a single fenced code block.";

/// Turns a prompt into free text
pub trait PatchProposer {
    /// Sends `prompt` and returns the raw answer
    fn propose(&mut self, prompt: &str) -> Result<String, Error>;
}

/// What one proposer round produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Proposal {
    /// A complete replacement source
    Patch(String),
    /// No usable patch, and why
    Error(String),
}

impl Proposal {
    /// Interprets one proposer round. Transport errors and answers without a
    /// code block both become [`Proposal::Error`].
    #[must_use]
    pub fn from_response(response: Result<String, Error>, language: Language) -> Self {
        match response {
            Ok(text) => match extract_code_block(&text, language) {
                Some(code) => Self::Patch(code),
                None => Self::Error("the response contained no fenced code block".into()),
            },
            Err(err) => Self::Error(format!("the proposer could not be reached: {err}")),
        }
    }
}

#[derive(Debug)]
struct Fenced<'a> {
    tag: String,
    body: Vec<&'a str>,
}

/// Extracts the replacement source from a free-text answer.
///
/// Blocks tagged for `language` win over untagged blocks, which win over blocks
/// tagged with anything else. Within a class the first block wins. Empty and
/// unterminated blocks are ignored.
#[must_use]
pub fn extract_code_block(response: &str, language: Language) -> Option<String> {
    extract_block(response, language.fence_tags())
}

/// Like [`extract_code_block`], preferring blocks tagged with one of `tags`
#[must_use]
pub fn extract_block(response: &str, tags: &[&str]) -> Option<String> {
    let mut blocks = vec![];
    let mut open: Option<Fenced> = None;

    for line in response.lines() {
        let trimmed = line.trim_start();
        match open.take() {
            None => {
                if let Some(info) = trimmed.strip_prefix("```") {
                    let tag = info.split_whitespace().next().unwrap_or("").to_lowercase();
                    open = Some(Fenced { tag, body: vec![] });
                }
            }
            Some(mut block) => {
                if trimmed.trim_end() == "```" {
                    blocks.push(block);
                } else {
                    block.body.push(line);
                    open = Some(block);
                }
            }
        }
    }

    let blocks = blocks
        .into_iter()
        .filter(|b| b.body.iter().any(|l| !l.trim().is_empty()))
        .collect::<Vec<_>>();
    let tagged = blocks.iter().find(|b| tags.contains(&b.tag.as_str()));
    let untagged = || blocks.iter().find(|b| b.tag.is_empty());

    tagged
        .or_else(untagged)
        .or_else(|| blocks.first())
        .map(|b| {
            let mut code = b.body.join("\n");
            code.push('\n');
            code
        })
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatAnswer,
}

#[derive(Debug, Deserialize)]
struct ChatAnswer {
    content: Option<String>,
}

/// Talks to an OpenAI-compatible `/chat/completions` endpoint
#[derive(Clone)]
pub struct OpenAiProposer {
    agent: ureq::Agent,
    endpoint: String,
    model: String,
    api_key: String,
    temperature: f32,
    system_prompt: String,
}

impl fmt::Debug for OpenAiProposer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenAiProposer")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .finish_non_exhaustive()
    }
}

impl OpenAiProposer {
    /// Creates a proposer for `base_url` (e.g. `https://api.openai.com/v1`)
    #[must_use]
    pub fn new(base_url: &str, model: &str, api_key: String, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(timeout)
            .timeout_connect(Duration::from_secs(10))
            .build();
        Self {
            agent,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            model: model.into(),
            api_key,
            temperature: 0.2,
            system_prompt: DEFAULT_SYSTEM_PROMPT.into(),
        }
    }

    /// Like [`OpenAiProposer::new`], with the key taken from the environment variable `key_var`
    pub fn from_env(
        base_url: &str,
        model: &str,
        key_var: &str,
        timeout: Duration,
    ) -> Result<Self, Error> {
        let api_key = env::var(key_var).map_err(|_| {
            Error::setup(format!("No API key: environment variable {key_var} is not set"))
        })?;
        Ok(Self::new(base_url, model, api_key, timeout))
    }

    /// Sampling temperature
    #[must_use]
    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Replaces the system prompt
    #[must_use]
    pub fn system_prompt<S: Into<String>>(mut self, system_prompt: S) -> Self {
        self.system_prompt = system_prompt.into();
        self
    }
}

impl PatchProposer for OpenAiProposer {
    fn propose(&mut self, prompt: &str) -> Result<String, Error> {
        let request = ChatRequest {
            model: &self.model,
            temperature: self.temperature,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &self.system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
        };
        log::info!(
            "Requesting completion from {} ({} prompt chars)",
            self.endpoint,
            prompt.chars().count()
        );
        let response: ChatResponse = self
            .agent
            .post(&self.endpoint)
            .set("Authorization", &format!("Bearer {}", self.api_key))
            .send_json(&request)?
            .into_json()
            .map_err(|err| Error::transport(format!("Malformed completion response: {err}")))?;

        response
            .choices
            .into_iter()
            .find_map(|choice| choice.message.content)
            .ok_or_else(|| Error::transport("Completion response had no content"))
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        net::TcpListener,
        thread,
        time::Duration,
    };

    use crate::{
        proposer::{extract_code_block, OpenAiProposer, PatchProposer, Proposal},
        target::Language,
        Error,
    };

    #[test]
    fn test_extract_prefers_language_tag() {
        let answer = "Here you go:\n```\nuntagged();\n```\nand\n```c\nint main() { return 0; }\n```\n";
        assert_eq!(
            extract_code_block(answer, Language::C).as_deref(),
            Some("int main() { return 0; }\n")
        );
        // no C++ block, so the untagged one wins over the C one
        assert_eq!(
            extract_code_block(answer, Language::Cpp).as_deref(),
            Some("untagged();\n")
        );
    }

    #[test]
    fn test_extract_falls_back_to_any_block() {
        let answer = "```python\nprint(1)\n```";
        assert_eq!(extract_code_block(answer, Language::C).as_deref(), Some("print(1)\n"));
    }

    #[test]
    fn test_extract_rejects_empty_and_unterminated() {
        assert_eq!(extract_code_block("I cannot help with that.", Language::C), None);
        assert_eq!(extract_code_block("```c\n\n   \n```", Language::C), None);
        assert_eq!(extract_code_block("```c\nint main() {", Language::C), None);
    }

    #[test]
    fn test_extract_keeps_indentation() {
        let answer = "```cpp\nint f() {\n    return 1;\n}\n```";
        assert_eq!(
            extract_code_block(answer, Language::Cpp).as_deref(),
            Some("int f() {\n    return 1;\n}\n")
        );
    }

    #[test]
    fn test_proposal_from_response() {
        assert_eq!(
            Proposal::from_response(Ok("```c\nx;\n```".into()), Language::C),
            Proposal::Patch("x;\n".into())
        );
        assert!(matches!(
            Proposal::from_response(Ok("no code".into()), Language::C),
            Proposal::Error(_)
        ));
        match Proposal::from_response(Err(Error::transport("connection refused")), Language::C) {
            Proposal::Error(reason) => assert!(reason.contains("connection refused")),
            Proposal::Patch(_) => panic!("transport errors never carry a patch"),
        }
    }

    /// Serves exactly one HTTP response and hands back the raw request
    fn serve_once(
        status: &'static str,
        body: &'static str,
    ) -> (String, thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/v1", listener.local_addr().unwrap());
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut request = vec![];
            let mut buf = [0_u8; 4096];
            loop {
                let n = stream.read(&mut buf).unwrap();
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request);
                if let Some(end) = text.find("\r\n\r\n") {
                    let len = text[..end]
                        .to_lowercase()
                        .lines()
                        .find_map(|l| l.strip_prefix("content-length:").map(|v| v.trim().to_string()))
                        .map_or(0, |v| v.parse::<usize>().unwrap());
                    if request.len() >= end + 4 + len {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).unwrap();
            String::from_utf8_lossy(&request).into_owned()
        });
        (url, handle)
    }

    #[test]
    fn test_openai_round_trip() {
        let (url, server) = serve_once(
            "200 OK",
            r#"{"choices":[{"index":0,"message":{"role":"assistant","content":"```c\nfixed();\n```"}}]}"#,
        );
        let mut proposer =
            OpenAiProposer::new(&url, "gpt-test", "sk-test".into(), Duration::from_secs(5));
        let answer = proposer.propose("fix it").unwrap();
        assert_eq!(answer, "```c\nfixed();\n```");

        let request = server.join().unwrap();
        assert!(request.starts_with("POST /v1/chat/completions"));
        assert!(request.contains("Bearer sk-test"));
        assert!(request.contains("\"model\":\"gpt-test\""));
        assert!(request.contains("fix it"));
        assert!(!format!("{proposer:?}").contains("sk-test"));
    }

    #[test]
    fn test_openai_http_error_is_transport() {
        let (url, server) = serve_once("500 Internal Server Error", r#"{"error":"overloaded"}"#);
        let mut proposer = OpenAiProposer::new(&url, "m", "k".into(), Duration::from_secs(5));
        match proposer.propose("fix it") {
            Err(Error::Transport(msg, _)) => assert!(msg.contains("500")),
            other => panic!("expected a transport error, got {other:?}"),
        }
        server.join().unwrap();
    }
}
