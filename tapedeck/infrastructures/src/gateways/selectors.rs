use ::async_trait::async_trait;
use ::use_cases::gateways::DestinationSelector;

use crate::utils::aliases::Fallible;

/// Always answers with the path it was built with.
#[derive(Debug, Clone, ::derive_new::new)]
pub struct FixedDestination {
    #[new(into)]
    path: ::std::path::PathBuf,
}

#[async_trait]
impl DestinationSelector for FixedDestination {
    async fn select(self: ::std::sync::Arc<Self>, _: &::std::path::Path) -> Fallible<Option<::std::path::PathBuf>> {
        Ok(Some(self.path.clone()))
    }
}

/// Asks for a destination on a line-oriented input.
///
/// An empty answer takes the suggestion, `q` or end of input backs out.
pub struct PromptDestination<Input> {
    input: ::tokio::sync::Mutex<::tokio::io::BufReader<Input>>,
}

impl PromptDestination<::tokio::io::Stdin> {
    pub fn stdin() -> Self {
        Self::new(::tokio::io::stdin())
    }
}

impl<Input> PromptDestination<Input>
where
    Input: ::tokio::io::AsyncRead + ::core::marker::Unpin,
{
    pub fn new(input: Input) -> Self {
        Self { input: ::tokio::sync::Mutex::new(::tokio::io::BufReader::new(input)) }
    }
}

#[async_trait]
impl<Input> DestinationSelector for PromptDestination<Input>
where
    Input: ::tokio::io::AsyncRead + ::core::marker::Unpin + ::core::marker::Send + 'static,
{
    async fn select(
        self: ::std::sync::Arc<Self>, suggested: &::std::path::Path,
    ) -> Fallible<Option<::std::path::PathBuf>> {
        use ::tokio::io::AsyncBufReadExt as _;
        use ::tokio::io::AsyncWriteExt as _;

        let mut prompt = ::tokio::io::stderr();
        prompt
            .write_all(format!("Save to [{}] (q to cancel): ", suggested.display()).as_bytes())
            .await?;
        prompt.flush().await?;

        let mut answer = String::new();

        if self.input.lock().await.read_line(&mut answer).await? == 0 {
            ::tracing::debug!("destination prompt reached end of input");
            return Ok(None);
        }

        match answer.trim() {
            "" => Ok(Some(suggested.to_path_buf())),
            "q" | "Q" => Ok(None),
            answer => Ok(Some(::std::path::PathBuf::from(answer))),
        }
    }
}
