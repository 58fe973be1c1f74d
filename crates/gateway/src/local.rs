//! Proxy for `local-*`/`gemma-*` models against an OpenAI-compatible
//! endpoint.

use std::collections::VecDeque;

use eventsource_stream::Eventsource;
use futures::StreamExt;
use secrecy::{ExposeSecret, SecretString};

use crate::{
    error::{GatewayError, GatewayResult},
    http_client::default_http_client,
    messages::{anthropic::MessagesRequest, openai},
    transcode::openai::{StreamAdapter, chat_request, response_to_message},
    upstream::{EventStream, UpstreamReply},
};

/// Client for the configured local endpoint.
pub struct LocalGateway {
    client: reqwest::Client,
    url: String,
    api_key: Option<SecretString>,
}

impl LocalGateway {
    /// Gateway for the configured local endpoint.
    pub fn new(config: &config::LocalLlmConfig) -> Self {
        Self {
            client: default_http_client(),
            url: config.url.clone(),
            api_key: config.api_key.clone(),
        }
    }

    /// Forward one validated request, transcoding both directions.
    pub async fn forward(&self, request: &MessagesRequest) -> GatewayResult<UpstreamReply> {
        let chat = chat_request(request);
        let streaming = request.stream.unwrap_or(false);

        let mut builder = self.client.post(&self.url).json(&chat);

        if let Some(api_key) = &self.api_key {
            builder = builder.bearer_auth(api_key.expose_secret());
        }

        let response = builder.send().await.map_err(|e| GatewayError::Upstream {
            status: 502,
            message: format!("Local Agent Error: {e}"),
        })?;

        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            log::error!("Local endpoint returned {status}: {body}");

            return Err(GatewayError::Upstream {
                status: 502,
                message: format!("Local Agent Error: upstream returned {status}: {body}"),
            });
        }

        if streaming {
            Ok(UpstreamReply::Stream(decode_stream(response, &request.model)))
        } else {
            let text = response.text().await.map_err(|e| GatewayError::Upstream {
                status: 502,
                message: format!("Local Agent Error: failed to read response: {e}"),
            })?;

            let chat_response: openai::ChatResponse = sonic_rs::from_str(&text).map_err(|e| {
                log::error!("Failed to parse local endpoint response: {e}");
                GatewayError::Upstream {
                    status: 502,
                    message: "Local Agent Error: unparseable upstream response".to_string(),
                }
            })?;

            Ok(UpstreamReply::Message(response_to_message(chat_response, &request.model)))
        }
    }
}

fn decode_stream(response: reqwest::Response, model: &str) -> EventStream {
    let sse = response.bytes_stream().eventsource();
    let adapter = StreamAdapter::new(model);

    let stream = futures::stream::unfold(
        (Box::pin(sse), adapter, VecDeque::new(), false),
        |(mut source, mut adapter, mut queue, mut done)| async move {
            loop {
                if let Some(event) = queue.pop_front() {
                    return Some((event, (source, adapter, queue, done)));
                }

                if done {
                    return None;
                }

                match source.next().await {
                    Some(Ok(sse_event)) => {
                        if sse_event.data.trim() == "[DONE]" {
                            continue;
                        }

                        match sonic_rs::from_str::<openai::ChatChunk>(&sse_event.data) {
                            Ok(chunk) => queue.extend(adapter.process(chunk)),
                            Err(e) => log::warn!("Failed to parse local stream chunk: {e}"),
                        }
                    }
                    Some(Err(e)) => log::warn!("SSE decoding error in local stream: {e}"),
                    None => {
                        done = true;
                        queue.extend(adapter.finish());
                    }
                }
            }
        },
    );

    Box::pin(stream)
}
