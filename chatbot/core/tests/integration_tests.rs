//! Integration Tests for the Chat Client
//!
//! Drives `ChatClient` end-to-end through the in-process transport:
//! - A full UBTI interview, from kickoff to result
//! - Cancellation mid-answer with chunks still arriving
//! - Mid-stream failure and non-2xx replies
//! - One exchange per session at a time
//!
//! Pacing tests run on tokio's paused clock.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pretty_assertions::assert_eq;

use chatbot_core::chat::UBTI_KICKOFF_MESSAGE;
use chatbot_core::transport::encode_record;
use chatbot_core::{
    ChatClient, ChatError, Endpoints, ExchangeError, ExchangeStatus, InProcessTransport,
    MessageRole, ProtocolEvent, ScriptedResponse, SessionId, StreamChunk, StreamConsumer,
    StreamingState, ThrottlePresets, Tone, UbtiPhase,
};

// =============================================================================
// Test Infrastructure
// =============================================================================

/// Shared record of everything a surface was shown
#[derive(Clone, Debug, Default)]
struct Surface {
    chunks: Arc<Mutex<Vec<StreamChunk>>>,
    questions: Arc<Mutex<Vec<String>>>,
    errors: Arc<Mutex<Vec<ExchangeError>>>,
}

impl Surface {
    fn texts(&self) -> Vec<String> {
        self.chunks
            .lock()
            .iter()
            .filter_map(|c| c.as_text().map(str::to_string))
            .collect()
    }

    fn chunk_count(&self) -> usize {
        self.chunks.lock().len()
    }
}

impl StreamConsumer for Surface {
    fn on_chunk(&mut self, chunk: StreamChunk) {
        self.chunks.lock().push(chunk);
    }

    fn on_question(&mut self, question: &str) {
        self.questions.lock().push(question.to_string());
    }

    fn on_error(&mut self, error: &ExchangeError) {
        self.errors.lock().push(error.clone());
    }
}

fn client() -> ChatClient<InProcessTransport> {
    ChatClient::new(
        InProcessTransport::new(),
        Endpoints::default(),
        ThrottlePresets::default(),
    )
}

fn chunk(content: &str) -> ProtocolEvent {
    ProtocolEvent::MessageChunk {
        content: content.to_string(),
    }
}

fn question(step: i32, text: &str) -> ProtocolEvent {
    ProtocolEvent::QuestionContent {
        question: text.to_string(),
        step,
        total_steps: 4,
    }
}

fn log(client: &ChatClient<InProcessTransport>, id: &SessionId) -> Vec<(MessageRole, String)> {
    client
        .store()
        .lock()
        .get(id)
        .map(|s| s.messages.iter().map(|m| (m.role, m.content.clone())).collect())
        .unwrap_or_default()
}

// =============================================================================
// UBTI Interview
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_full_ubti_interview() {
    let client = client();
    let transport = client.transport();

    transport.push(ScriptedResponse::ndjson(&[
        ProtocolEvent::MessageStart,
        chunk("시작할게요"),
        ProtocolEvent::MessageEnd,
        ProtocolEvent::QuestionStart,
        question(0, "Q1"),
        ProtocolEvent::QuestionEnd,
    ]));
    let mut surface = Surface::default();
    let (session, outcome) = client
        .start_ubti(None, Tone::Muneoz, &mut surface)
        .await
        .unwrap();

    assert_eq!(outcome.status, ExchangeStatus::Completed);
    let chat = client.chat(&session).unwrap();
    let state = chat.ubti().snapshot();
    assert_eq!(state.phase, UbtiPhase::Active);
    assert_eq!(state.current_step, 0);
    assert_eq!(state.current_question_text.as_deref(), Some("Q1"));
    assert_eq!(*surface.questions.lock(), vec!["Q1".to_string()]);
    assert_eq!(
        log(&client, &session),
        vec![
            (MessageRole::User, UBTI_KICKOFF_MESSAGE.to_string()),
            (MessageRole::Bot, "시작할게요".to_string()),
        ]
    );

    // Answers are routed to the UBTI endpoint while the interview runs
    transport.push(ScriptedResponse::ndjson(&[
        ProtocolEvent::QuestionStart,
        question(1, "Q2"),
        ProtocolEvent::QuestionEnd,
    ]));
    client
        .send_message(&session, "넷플릭스", Tone::Muneoz, &mut surface)
        .await
        .unwrap();
    assert_eq!(chat.ubti().snapshot().current_step, 1);
    assert_eq!(chat.ubti().snapshot().progress_label().as_deref(), Some("2/4"));

    transport.push(ScriptedResponse::ndjson(&[ProtocolEvent::QuestionsComplete]));
    client
        .send_message(&session, "유튜브", Tone::Muneoz, &mut surface)
        .await
        .unwrap();
    assert_eq!(chat.ubti().phase(), UbtiPhase::ReadyToSubmit);
    assert!(chat.ubti().snapshot().ready_to_submit);

    transport.push(ScriptedResponse::Json(serde_json::json!({
        "ubti_type": "TACO",
        "summary": "데이터 러버"
    })));
    let result = client
        .fetch_ubti_result(&session, Tone::Muneoz)
        .await
        .unwrap();
    assert_eq!(result.field("ubti_type"), Some("TACO"));
    assert_eq!(chat.ubti().phase(), UbtiPhase::Completed);

    let requests = transport.requests();
    let paths: Vec<&str> = requests.iter().map(|r| r.path.as_str()).collect();
    assert_eq!(
        paths,
        vec!["/ubti/question", "/ubti/question", "/ubti/question", "/ubti/result"]
    );
    assert_eq!(requests[0].body["message"], UBTI_KICKOFF_MESSAGE);
    assert_eq!(
        requests[3].body,
        serde_json::json!({"session_id": session.as_str(), "tone": "muneoz", "message": ""})
    );

    // After the interview, messages are plain chat again
    transport.push(ScriptedResponse::ndjson(&[
        ProtocolEvent::MessageStart,
        chunk("네"),
        ProtocolEvent::MessageEnd,
    ]));
    client
        .send_message(&session, "고마워", Tone::Muneoz, &mut surface)
        .await
        .unwrap();
    assert_eq!(transport.requests().last().unwrap().path, "/chat");
}

#[tokio::test(start_paused = true)]
async fn test_reset_ubti_returns_messages_to_chat() {
    let client = client();
    let session = client.create_session(None);
    client.transport().push(ScriptedResponse::ndjson(&[
        ProtocolEvent::QuestionStart,
        question(0, "Q1"),
    ]));
    client
        .start_ubti(Some(&session), Tone::General, &mut Surface::default())
        .await
        .unwrap();
    assert!(client.chat(&session).unwrap().ubti().accepts_answers());

    client.reset_ubti(&session).unwrap();
    assert_eq!(client.chat(&session).unwrap().ubti().phase(), UbtiPhase::Idle);

    client
        .transport()
        .push(ScriptedResponse::ndjson(&[ProtocolEvent::MessageStart, ProtocolEvent::MessageEnd]));
    client
        .send_message(&session, "hello", Tone::General, &mut Surface::default())
        .await
        .unwrap();
    assert_eq!(client.transport().requests().last().unwrap().path, "/chat");
}

// =============================================================================
// Cancellation
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_cancellation_silences_further_chunks() {
    let client = client();
    let session = client.create_session(None);
    let (sender, response) = ScriptedResponse::channel(200);
    client.transport().push(response);

    let surface = Surface::default();
    let mut consumer = surface.clone();
    let turn = client.send_message(&session, "긴 답변 부탁해", Tone::General, &mut consumer);

    let driver = async {
        sender.send_event(&ProtocolEvent::MessageStart).await;
        sender.send_event(&chunk("abcdefgh")).await;
        // First slice goes out at once, the rest waits for the 30ms tick
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(client.cancel(&session));
        let seen_at_cancel = surface.chunk_count();

        sender.send_event(&chunk("ignored")).await;
        sender.send_event(&ProtocolEvent::MessageEnd).await;
        drop(sender);
        tokio::time::sleep(Duration::from_millis(200)).await;
        seen_at_cancel
    };

    let (outcome, seen_at_cancel) = tokio::join!(turn, driver);
    let outcome = outcome.unwrap();

    assert_eq!(outcome.status, ExchangeStatus::Cancelled);
    assert_eq!(surface.chunk_count(), seen_at_cancel);
    assert_eq!(surface.texts(), vec!["ab".to_string()]);
    assert!(surface.errors.lock().is_empty());

    let chat = client.chat(&session).unwrap();
    assert!(!chat.is_streaming());
    assert_eq!(chat.streaming_state(), StreamingState::Idle);
    assert_eq!(
        log(&client, &session),
        vec![(MessageRole::User, "긴 답변 부탁해".to_string())]
    );
}

#[tokio::test(start_paused = true)]
async fn test_reset_streaming_state_cancels_exchange() {
    let client = client();
    let session = client.create_session(None);
    let (sender, response) = ScriptedResponse::channel(200);
    client.transport().push(response);

    let mut surface = Surface::default();
    let turn = client.send_message(&session, "hi", Tone::General, &mut surface);
    let driver = async {
        sender.send_event(&chunk("some text")).await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        client.reset_streaming_state(&session).unwrap();
        // Keep the body open; only the reset may end the exchange
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(sender);
    };

    let (outcome, ()) = tokio::join!(turn, driver);
    assert_eq!(outcome.unwrap().status, ExchangeStatus::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn test_reset_ubti_mid_answer_stays_idle() {
    let client = client();
    let session = client.create_session(None);
    let (sender, response) = ScriptedResponse::channel(200);
    client.transport().push(response);

    let mut surface = Surface::default();
    let turn = client.send_ubti_answer(&session, "A", Tone::General, &mut surface);
    let driver = async {
        sender.send_event(&ProtocolEvent::QuestionStart).await;
        tokio::time::sleep(Duration::from_millis(1)).await;
        let chat = client.chat(&session).unwrap();
        assert_eq!(chat.ubti().phase(), UbtiPhase::Active);

        client.reset_ubti(&session).unwrap();
        assert_eq!(chat.ubti().phase(), UbtiPhase::Idle);

        sender.send_event(&question(1, "Q2")).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(sender);
    };

    let (outcome, ()) = tokio::join!(turn, driver);
    assert_eq!(outcome.unwrap().status, ExchangeStatus::Cancelled);

    let snapshot = client.chat(&session).unwrap().ubti().snapshot();
    assert_eq!(snapshot.phase, UbtiPhase::Idle);
    assert_eq!(snapshot.current_step, -1);
    assert!(!snapshot.in_progress);
}

#[tokio::test(start_paused = true)]
async fn test_second_turn_rejected_while_streaming() {
    let client = client();
    let session = client.create_session(None);
    let (sender, response) = ScriptedResponse::channel(200);
    client.transport().push(response);

    let mut first = Surface::default();
    let turn = client.send_message(&session, "first", Tone::General, &mut first);
    let driver = async {
        sender.send_event(&ProtocolEvent::MessageStart).await;
        tokio::time::sleep(Duration::from_millis(1)).await;

        let second = client
            .send_message(&session, "second", Tone::General, &mut Surface::default())
            .await;

        sender.send_event(&chunk("done")).await;
        sender.send_event(&ProtocolEvent::MessageEnd).await;
        drop(sender);
        second
    };

    let (outcome, second) = tokio::join!(turn, driver);
    assert_eq!(outcome.unwrap().text, "done");
    assert_eq!(second.unwrap_err(), ChatError::TurnInProgress);
    assert_eq!(client.transport().requests().len(), 1);
}

// =============================================================================
// Failures
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_mid_stream_failure_keeps_partial_answer() {
    let client = client();
    let session = client.create_session(None);
    client.transport().push(ScriptedResponse::failing_after(
        [
            encode_record(&ProtocolEvent::MessageStart),
            encode_record(&chunk("반쯤 왔어요 ")),
            encode_record(&chunk("그리고 더 많은 텍스트")),
        ],
        "connection reset by peer",
    ));

    let surface = Surface::default();
    let err = client
        .send_message(&session, "질문", Tone::General, &mut surface.clone())
        .await
        .unwrap_err();

    match &err {
        ChatError::Exchange(e) => {
            assert_eq!(e.partial_text(), Some("반쯤 왔어요 그리고 더 많은 텍스트"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(surface.errors.lock().len(), 1);

    let view = client.chat(&session).unwrap().view();
    assert_eq!(view.streaming_state, StreamingState::Failed);
    assert!(view.last_error.is_some());
    // Text still waiting for its pacing tick is kept, not just what was shown
    assert_eq!(view.streaming_text, "반쯤 왔어요 그리고 더 많은 텍스트");
    assert_eq!(
        log(&client, &session),
        vec![
            (MessageRole::User, "질문".to_string()),
            (MessageRole::Bot, "반쯤 왔어요 그리고 더 많은 텍스트".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_error_status_is_reported_once() {
    let client = client();
    let session = client.create_session(None);
    client
        .transport()
        .push(ScriptedResponse::status(502, "bad gateway"));

    let surface = Surface::default();
    let err = client
        .likes_recommendation(&session, Tone::General, &mut surface.clone())
        .await
        .unwrap_err();

    assert_eq!(
        err,
        ChatError::Exchange(ExchangeError::ProtocolStatus {
            status: 502,
            body: "bad gateway".to_string()
        })
    );
    assert_eq!(surface.errors.lock().len(), 1);
    assert_eq!(surface.chunk_count(), 0);

    let view = client.chat(&session).unwrap().view();
    assert!(!view.expecting_cards);
    assert_eq!(view.streaming_state, StreamingState::Failed);
}

#[tokio::test]
async fn test_ended_session_rejects_turns() {
    let client = client();
    let session = client.create_session(None);
    let next = client.reset_chat(&session);

    let err = client
        .send_message(&session, "hello?", Tone::General, &mut Surface::default())
        .await
        .unwrap_err();
    assert_eq!(err, ChatError::SessionEnded);
    assert_ne!(session, next);
    assert!(client.transport().requests().is_empty());
}
