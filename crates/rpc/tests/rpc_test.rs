//! Unary calls through the registrar and the client adapter.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use busrpc_messaging::codec::JsonCodec;
use busrpc_messaging_memory::MemoryTransport;
use busrpc_rpc::{ClientConn, Context, Error, ServiceRegistrar};
use common::{
    Fixture, PUBLISH, REMOTE_PREFIX, SLEEP, TEST, TestImpl, TestRequest, TestResponse,
    definition, options, registry, start_service,
};
use ed25519_dalek::SigningKey;
use tokio::time::timeout;

#[tokio::test]
async fn test_unary_call() {
    let fixture = Fixture::new().await;
    let ctx = Context::background()
        .with_header("trace", "some")
        .with_header("trace", "identity");

    let response: TestResponse = timeout(
        Duration::from_secs(1),
        fixture.conn.invoke(
            &ctx,
            TEST,
            &TestRequest {
                a: 123,
                b: 321,
                ..TestRequest::default()
            },
        ),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(response.value, 444);
    assert_eq!(
        response.subject,
        "test_prefix.server.override.test.override.test.method"
    );
    assert_eq!(response.header, "some,identity");

    let counters = fixture.client.counters();
    assert_eq!(counters.msg_out, 1);
    assert_eq!(counters.msg_in, 1);

    fixture.shutdown().await;
}

#[tokio::test]
async fn test_unary_handler_error() {
    let fixture = Fixture::new().await;

    let result: Result<TestResponse, Error> = fixture
        .conn
        .invoke(
            &fixture.ctx,
            TEST,
            &TestRequest {
                a: -123,
                b: -321,
                ..TestRequest::default()
            },
        )
        .await;

    match result {
        Err(Error::Remote(message)) => assert_eq!(
            message,
            "types.rpc.TestService.Test: negative value: a:-123 b:-321"
        ),
        other => panic!("unexpected result: {other:?}"),
    }

    // The registrar keeps serving after a handler error.
    let response: TestResponse = fixture
        .conn
        .invoke(
            &fixture.ctx,
            TEST,
            &TestRequest {
                a: 1,
                b: 2,
                ..TestRequest::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(response.value, 3);

    fixture.shutdown().await;
}

#[tokio::test]
async fn test_disabled_method_makes_no_bus_calls() {
    let fixture = Fixture::new().await;
    let before = fixture.transport.stats();

    let result: Result<TestResponse, Error> = fixture
        .conn
        .invoke(&fixture.ctx, PUBLISH, &TestRequest::default())
        .await;
    assert!(matches!(
        result,
        Err(Error::CallingDisabled { ref method, .. }) if method == "Publish"
    ));
    assert_eq!(
        result.unwrap_err().to_string(),
        "calling disabled: Publish@types.rpc.TestService"
    );

    let stream = fixture.conn.new_stream(&fixture.ctx, PUBLISH);
    assert!(matches!(stream, Err(Error::CallingDisabled { .. })));

    assert_eq!(fixture.transport.stats(), before);

    fixture.shutdown().await;
}

#[tokio::test]
async fn test_derivation_errors_make_no_bus_calls() {
    let fixture = Fixture::new().await;
    let before = fixture.transport.stats();

    let invalid: Result<TestResponse, Error> = fixture
        .conn
        .invoke(&fixture.ctx, "types.rpc.TestService", &TestRequest::default())
        .await;
    assert!(matches!(invalid, Err(Error::InvalidMethod(_))));

    let unknown: Result<TestResponse, Error> = fixture
        .conn
        .invoke(&fixture.ctx, "/types.rpc.Missing/Test", &TestRequest::default())
        .await;
    assert!(matches!(unknown, Err(Error::UnknownService(_))));

    let missing: Result<TestResponse, Error> = fixture
        .conn
        .invoke(&fixture.ctx, "/types.rpc.TestService/Nope", &TestRequest::default())
        .await;
    assert!(matches!(missing, Err(Error::UnknownMethod { .. })));

    assert_eq!(fixture.transport.stats(), before);

    fixture.shutdown().await;
}

#[tokio::test]
async fn test_invoke_deadline() {
    let fixture = Fixture::new().await;
    let ctx = fixture.ctx.with_timeout(Duration::from_millis(50));

    let result: Result<TestResponse, Error> = timeout(
        Duration::from_secs(1),
        fixture.conn.invoke(&ctx, SLEEP, &TestRequest::default()),
    )
    .await
    .unwrap();
    assert!(matches!(result, Err(Error::DeadlineExceeded)));

    fixture.shutdown().await;
}

#[tokio::test]
async fn test_invoke_cancelled() {
    let fixture = Fixture::new().await;
    let ctx = fixture.ctx.child();

    let canceller = ctx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel();
    });

    let result: Result<TestResponse, Error> = timeout(
        Duration::from_secs(1),
        fixture.conn.invoke(&ctx, SLEEP, &TestRequest::default()),
    )
    .await
    .unwrap();
    assert!(matches!(result, Err(Error::Cancelled)));

    let again: Result<TestResponse, Error> =
        fixture.conn.invoke(&ctx, TEST, &TestRequest::default()).await;
    assert!(matches!(again, Err(Error::Cancelled)));

    // The abandoned request reached the bus; the second never did.
    assert_eq!(fixture.client.counters().msg_out, 1);
    assert_eq!(fixture.client.counters().msg_in, 0);

    fixture.shutdown().await;
}

#[tokio::test]
async fn test_signed_calls_and_allowlist() {
    let client_key = SigningKey::from_bytes(&[1; 32]);
    let server_options = options(common::SERVER_PREFIX, common::SERVER_NAME)
        .with_known_public_keys([client_key.verifying_key()]);
    let client_options = options("test_client", "client").with_signing_key(client_key);

    let fixture = Fixture::with_options(server_options, client_options).await;

    let response: TestResponse = fixture
        .conn
        .invoke(
            &fixture.ctx,
            TEST,
            &TestRequest {
                a: 2,
                b: 2,
                ..TestRequest::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(response.value, 4);

    let stranger = start_service(
        &fixture.transport,
        options("stranger", "client").with_signing_key(SigningKey::from_bytes(&[2; 32])),
    )
    .await;
    let conn = ClientConn::new(stranger.clone(), registry(), REMOTE_PREFIX);

    let result: Result<TestResponse, Error> = conn
        .invoke(&fixture.ctx, TEST, &TestRequest::default())
        .await;
    match result {
        Err(Error::Remote(message)) => assert!(
            message.starts_with("types.rpc.TestService.Test: unknown identity"),
            "{message}"
        ),
        other => panic!("unexpected result: {other:?}"),
    }

    stranger.shutdown().await;
    fixture.shutdown().await;
}

#[tokio::test]
async fn test_registrar_stops_with_context() {
    let fixture = Fixture::new().await;
    let callable = fixture.registrar.subscription_count();
    assert_eq!(callable, 5);

    let before = fixture.transport.stats().unsubscribed;
    fixture.ctx.cancel();

    timeout(Duration::from_secs(1), async {
        while fixture.registrar.subscription_count() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    // Unsubscribes are counted once each.
    timeout(Duration::from_secs(1), async {
        while fixture.transport.stats().unsubscribed < before + 5 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let result: Result<TestResponse, Error> = fixture
        .conn
        .invoke(&Context::background(), TEST, &TestRequest::default())
        .await;
    assert!(matches!(result, Err(Error::Service(_))));

    fixture.shutdown().await;
}

#[tokio::test]
async fn test_registrar_start_twice() {
    let fixture = Fixture::new().await;
    let result = fixture.registrar.start(&fixture.ctx).await;
    assert!(matches!(result, Err(Error::AlreadyStarted)));
    fixture.shutdown().await;
}

#[tokio::test]
#[should_panic(expected = "duplicate service registration")]
async fn test_register_service_twice_panics() {
    let transport = MemoryTransport::default();
    let service = start_service(&transport, options("a", "b")).await;
    let registrar: ServiceRegistrar<MemoryTransport, JsonCodec> =
        ServiceRegistrar::new(service, registry());

    registrar.register_service(definition(Arc::new(TestImpl)));
    registrar.register_service(definition(Arc::new(TestImpl)));
}

#[tokio::test]
#[should_panic(expected = "has no handler")]
async fn test_register_incomplete_service_panics() {
    let transport = MemoryTransport::default();
    let service = start_service(&transport, options("a", "b")).await;
    let registrar = ServiceRegistrar::new(service, registry());

    registrar.register_service(
        busrpc_rpc::ServiceDefinition::new(common::SERVICE)
            .unary("Test", |_ctx, _request: TestRequest| async {
                Ok::<_, busrpc_service::HandlerError>(TestResponse::default())
            }),
    );
}

#[tokio::test]
async fn test_client_vars_reject_unbound_wildcards() {
    let fixture = Fixture::new().await;

    let unbound = fixture.conn.subject_for(common::WATCH);
    assert!(matches!(unbound, Err(Error::InvalidSubject(_))));

    let vars = HashMap::from([("types.rpc.TestService/id".to_string(), "42".to_string())]);
    let conn = fixture.conn.clone().with_vars(vars);
    assert_eq!(
        conn.subject_for(common::WATCH).unwrap().as_str(),
        "test_prefix.server.override.test.watch.42"
    );

    fixture.shutdown().await;
}
