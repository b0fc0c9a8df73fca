//! HTTP gateway for the conversation backend.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;

use parley_shared::{
    Conversation, ConversationDetail, ConversationId, ConversationUpdate, Message,
    NewConversation, Role, SubmitMessage,
};

use crate::error::{GatewayError, GatewayResult};
use crate::gateway::RemoteGateway;
use crate::wire::{ConversationBody, ErrorBody, QueryBody, QueryMessage, WireConversation};

/// reqwest-backed [`RemoteGateway`].
#[derive(Debug, Clone)]
pub struct HttpGateway {
    client: Client,
    /// Base URL of the backend (e.g. "http://localhost:8000"), no trailing slash.
    base_url: String,
}

impl HttpGateway {
    /// Create a gateway with a per-request timeout.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> GatewayResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::transport(format!("failed to build HTTP client: {e}")))?;

        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn fetch_detail(&self, id: &ConversationId) -> GatewayResult<ConversationDetail> {
        let response = self
            .client
            .get(self.url(&format!("/conversations/{id}")))
            .send()
            .await?;
        let wire: WireConversation = handle_response(response).await?;
        Ok(wire.into_detail())
    }
}

#[async_trait]
impl RemoteGateway for HttpGateway {
    async fn list_conversations(&self) -> GatewayResult<Vec<Conversation>> {
        let response = self.client.get(self.url("/conversations")).send().await?;
        let wire: Vec<WireConversation> = handle_response(response).await?;
        debug!(count = wire.len(), "Fetched conversation list");
        Ok(wire
            .into_iter()
            .map(WireConversation::into_conversation)
            .collect())
    }

    async fn get_conversation(&self, id: &ConversationId) -> GatewayResult<ConversationDetail> {
        let detail = self.fetch_detail(id).await?;
        debug!(
            conversation = %id,
            messages = detail.messages.len(),
            "Fetched conversation detail"
        );
        Ok(detail)
    }

    async fn create_conversation(&self, input: &NewConversation) -> GatewayResult<Conversation> {
        let body = ConversationBody {
            name: &input.name,
            params: input.params.as_ref().into(),
        };
        let response = self
            .client
            .post(self.url("/conversation"))
            .json(&body)
            .send()
            .await?;
        let wire: WireConversation = handle_response(response).await?;
        Ok(wire.into_conversation())
    }

    async fn update_conversation(
        &self,
        update: &ConversationUpdate,
    ) -> GatewayResult<Conversation> {
        let body = ConversationBody {
            name: &update.name,
            params: Some(&update.params).into(),
        };
        let response = self
            .client
            .put(self.url(&format!("/conversations/{}", update.id)))
            .json(&body)
            .send()
            .await?;
        let wire: WireConversation = handle_response(response).await?;
        Ok(wire.into_conversation())
    }

    async fn delete_conversation(&self, id: &ConversationId) -> GatewayResult<()> {
        let response = self
            .client
            .delete(self.url(&format!("/conversations/{id}")))
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    async fn submit_message(&self, submit: &SubmitMessage) -> GatewayResult<Vec<Message>> {
        let body = QueryBody {
            id: submit.conversation_id.as_str(),
            message: QueryMessage {
                role: Role::User,
                content: &submit.content,
            },
        };
        let response = self
            .client
            .post(self.url("/queries"))
            .json(&body)
            .send()
            .await?;
        check_status(response).await?;

        // The query response is not a thread; reload it so the caller gets
        // the server's own ordering and ids.
        let detail = self.fetch_detail(&submit.conversation_id).await?;
        Ok(detail.messages)
    }
}

/// Map a non-success status to the error taxonomy, passing successes through.
async fn check_status(response: Response) -> GatewayResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let url = response.url().to_string();
    let detail = match response.json::<ErrorBody>().await {
        Ok(body) => body.message(),
        Err(_) => status.to_string(),
    };

    Err(match status {
        StatusCode::NOT_FOUND => GatewayError::NotFound(detail),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            GatewayError::Validation(detail)
        }
        _ => GatewayError::Transport(format!("{url} returned {status}: {detail}")),
    })
}

async fn handle_response<T: DeserializeOwned>(response: Response) -> GatewayResult<T> {
    let response = check_status(response).await?;
    response
        .json()
        .await
        .map_err(|e| GatewayError::transport(format!("failed to parse response: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use parley_shared::{ConversationParams, MessageId, Model};
    use serde_json::json;

    fn gateway(server: &MockServer) -> HttpGateway {
        HttpGateway::new(server.base_url(), Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let gw = HttpGateway::new("http://localhost:8000/", Duration::from_secs(1)).unwrap();
        assert_eq!(gw.base_url(), "http://localhost:8000");
    }

    #[tokio::test]
    async fn test_list_conversations_keeps_server_order() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/conversations");
                then.status(200).json_body(json!([
                    {"id": "b", "name": "Second", "params": {}, "tokens": 3},
                    {"id": "a", "name": "First", "params": {"model": "gpt-3.5-turbo"}, "tokens": 0}
                ]));
            })
            .await;

        let list = gateway(&server).list_conversations().await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id.as_str(), "b");
        assert_eq!(list[1].params.model, Model::Gpt35Turbo);
    }

    #[tokio::test]
    async fn test_not_found_maps_to_not_found() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/conversations/missing");
                then.status(404)
                    .json_body(json!({"detail": "Conversation with ID missing not found"}));
            })
            .await;

        let err = gateway(&server)
            .get_conversation(&"missing".into())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            GatewayError::NotFound("Conversation with ID missing not found".into())
        );
    }

    #[tokio::test]
    async fn test_server_error_is_transport() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(DELETE).path("/conversations/c1");
                then.status(500).json_body(json!({"detail": "boom"}));
            })
            .await;

        let err = gateway(&server)
            .delete_conversation(&"c1".into())
            .await
            .unwrap_err();
        assert!(err.is_retriable());
    }

    #[tokio::test]
    async fn test_unprocessable_is_validation() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/conversation");
                then.status(422).json_body(json!({"detail": [{"msg": "field required"}]}));
            })
            .await;

        let err = gateway(&server)
            .create_conversation(&NewConversation::named("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
    }

    #[tokio::test]
    async fn test_update_sends_full_params() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(PUT).path("/conversations/c1").json_body(json!({
                    "name": "Renamed",
                    "params": {
                        "system_prompt": "terse",
                        "temperature": 0.5,
                        "max_completion_tokens": 200,
                        "model": "gpt-4o-mini"
                    }
                }));
                then.status(200).json_body(json!({
                    "id": "c1", "name": "Renamed", "tokens": 9,
                    "params": {"system_prompt": "terse", "temperature": 0.5,
                               "max_completion_tokens": 200, "model": "gpt-4o-mini"}
                }));
            })
            .await;

        let update = ConversationUpdate {
            id: "c1".into(),
            name: "Renamed".into(),
            params: ConversationParams {
                system_prompt: "terse".into(),
                temperature: 0.5,
                max_completion_tokens: 200,
                model: Model::Gpt4oMini,
            },
        };
        let updated = gateway(&server).update_conversation(&update).await.unwrap();
        mock.assert_async().await;
        assert_eq!(updated.name, "Renamed");
        assert_eq!(updated.tokens, 9);
    }

    #[tokio::test]
    async fn test_submit_returns_reloaded_thread() {
        let server = MockServer::start_async().await;
        let query = server
            .mock_async(|when, then| {
                when.method(POST).path("/queries").json_body(json!({
                    "id": "c1",
                    "message": {"role": "user", "content": "hello"}
                }));
                then.status(200).json_body(json!({"response": "hi there"}));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/conversations/c1");
                then.status(200).json_body(json!({
                    "id": "c1", "name": "Chat", "params": {}, "tokens": 20,
                    "messages": [
                        {"role": "user", "content": "hello"},
                        {"role": "assistant", "content": "hi there"}
                    ]
                }));
            })
            .await;

        let submit = SubmitMessage {
            conversation_id: "c1".into(),
            content: "hello".into(),
        };
        let messages = gateway(&server).submit_message(&submit).await.unwrap();
        query.assert_async().await;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].id, MessageId::confirmed("c1:1"));
        assert_eq!(messages[1].role, Role::Assistant);
    }

    #[tokio::test]
    async fn test_connection_refused_is_transport() {
        let gw = HttpGateway::new("http://127.0.0.1:9", Duration::from_secs(1)).unwrap();
        let err = gw.list_conversations().await.unwrap_err();
        assert!(matches!(err, GatewayError::Transport(_)));
    }
}
