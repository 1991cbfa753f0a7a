//! Shared fixture: a test service served and called over one in-memory bus.
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use busrpc_messaging::codec::JsonCodec;
use busrpc_messaging_memory::MemoryTransport;
use busrpc_rpc::{
    ClientConn, ClientStream, Context, DescriptorRegistry, MethodDescriptor, ServerStream,
    ServiceDefinition, ServiceDescriptor, ServiceRegistrar,
};
use busrpc_service::{HandlerError, Service, ServiceOptions};
use serde::{Deserialize, Serialize};

pub type TestService = Service<MemoryTransport, JsonCodec>;
pub type TestClientStream = ClientStream<MemoryTransport, JsonCodec>;

pub const SERVICE: &str = "types.rpc.TestService";
pub const TEST: &str = "/types.rpc.TestService/Test";
pub const TEST_STREAM: &str = "/types.rpc.TestService/TestStream";
pub const TEST_BIDI: &str = "/types.rpc.TestService/TestBidi";
pub const WATCH: &str = "/types.rpc.TestService/Watch";
pub const SLEEP: &str = "/types.rpc.TestService/Sleep";
pub const PUBLISH: &str = "/types.rpc.TestService/Publish";

pub const SERVER_PREFIX: &str = "test_prefix";
pub const SERVER_NAME: &str = "server";
pub const REMOTE_PREFIX: &str = "test_prefix.server";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TestRequest {
    pub a: i64,
    pub b: i64,
    pub count: i64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TestResponse {
    pub value: i64,
    pub subject: String,
    pub header: String,
}

pub struct TestImpl;

impl TestImpl {
    async fn test(&self, ctx: Context, request: TestRequest) -> Result<TestResponse, HandlerError> {
        if request.a < 0 && request.b < 0 {
            return Err(format!("negative value: a:{} b:{}", request.a, request.b).into());
        }

        Ok(TestResponse {
            value: request.a + request.b,
            subject: ctx.subject().map(ToString::to_string).unwrap_or_default(),
            header: ctx.headers().get_all("trace").join(","),
        })
    }

    async fn test_stream(
        &self,
        request: TestRequest,
        stream: ServerStream<MemoryTransport, JsonCodec>,
    ) -> Result<(), HandlerError> {
        if request.a < 0 && request.b < 0 {
            return Err(format!("negative value: a:{} b:{}", request.a, request.b).into());
        }

        for i in 1..=request.count {
            stream
                .send(&TestResponse {
                    value: (request.a + request.b) * i,
                    ..TestResponse::default()
                })
                .await?;
        }
        Ok(())
    }

    async fn test_bidi(
        &self,
        mut stream: ServerStream<MemoryTransport, JsonCodec>,
    ) -> Result<(), HandlerError> {
        while let Some(request) = stream.recv::<TestRequest>()? {
            stream
                .send(&TestResponse {
                    value: request.a + request.b,
                    ..TestResponse::default()
                })
                .await?;
        }
        Ok(())
    }

    async fn watch(
        &self,
        _request: TestRequest,
        stream: ServerStream<MemoryTransport, JsonCodec>,
    ) -> Result<(), HandlerError> {
        let subject = stream
            .context()
            .subject()
            .map(ToString::to_string)
            .unwrap_or_default();
        stream
            .send(&TestResponse {
                subject,
                ..TestResponse::default()
            })
            .await?;
        Ok(())
    }
}

pub fn registry() -> Arc<DescriptorRegistry> {
    let mut registry = DescriptorRegistry::new();
    registry
        .register(
            ServiceDescriptor::new(SERVICE)
                .with_subject_prefix("override.test")
                .with_method(
                    MethodDescriptor::unary("Test").with_subject_suffix("override.test.method"),
                )
                .with_method(MethodDescriptor::server_streaming("TestStream"))
                .with_method(MethodDescriptor::bidi_streaming("TestBidi"))
                .with_method(
                    MethodDescriptor::server_streaming("Watch").with_subject_suffix("watch.{id}"),
                )
                .with_method(MethodDescriptor::unary("Sleep"))
                .with_method(MethodDescriptor::unary("Publish").with_skip_inputs(true)),
        )
        .unwrap();
    Arc::new(registry)
}

pub fn definition(implementation: Arc<TestImpl>) -> ServiceDefinition<MemoryTransport, JsonCodec> {
    let test = Arc::clone(&implementation);
    let test_stream = Arc::clone(&implementation);
    let test_bidi = Arc::clone(&implementation);
    let watch = implementation;

    ServiceDefinition::new(SERVICE)
        .unary("Test", move |ctx, request: TestRequest| {
            let implementation = Arc::clone(&test);
            async move { implementation.test(ctx, request).await }
        })
        .server_streaming("TestStream", move |request: TestRequest, stream| {
            let implementation = Arc::clone(&test_stream);
            async move { implementation.test_stream(request, stream).await }
        })
        .bidi_streaming("TestBidi", move |stream| {
            let implementation = Arc::clone(&test_bidi);
            async move { implementation.test_bidi(stream).await }
        })
        .server_streaming("Watch", move |request: TestRequest, stream| {
            let implementation = Arc::clone(&watch);
            async move { implementation.watch(request, stream).await }
        })
        .unary("Sleep", |_ctx, _request: TestRequest| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, HandlerError>(TestResponse::default())
        })
}

pub fn options(prefix: &str, name: &str) -> ServiceOptions {
    ServiceOptions {
        prefix: prefix.to_string(),
        name: name.to_string(),
        ..ServiceOptions::default()
    }
}

pub async fn start_service(transport: &MemoryTransport, options: ServiceOptions) -> TestService {
    let service = Service::new(transport.clone(), JsonCodec, options).unwrap();
    service.start().await.unwrap();
    service
}

pub struct Fixture {
    pub transport: MemoryTransport,
    pub server: TestService,
    pub client: TestService,
    pub registrar: ServiceRegistrar<MemoryTransport, JsonCodec>,
    pub conn: ClientConn<MemoryTransport, JsonCodec>,
    pub ctx: Context,
}

impl Fixture {
    pub async fn new() -> Self {
        Self::with_options(
            options(SERVER_PREFIX, SERVER_NAME),
            options("test_client", "client"),
        )
        .await
    }

    pub async fn with_options(server: ServiceOptions, client: ServiceOptions) -> Self {
        let transport = MemoryTransport::default();
        let server = start_service(&transport, server).await;
        let client = start_service(&transport, client).await;
        let registry = registry();

        let registrar = ServiceRegistrar::new(server.clone(), Arc::clone(&registry));
        registrar.register_service(definition(Arc::new(TestImpl)));

        let ctx = Context::background();
        registrar.start(&ctx).await.unwrap();

        let conn = ClientConn::new(client.clone(), registry, REMOTE_PREFIX);

        Self {
            transport,
            server,
            client,
            registrar,
            conn,
            ctx,
        }
    }

    pub async fn shutdown(self) {
        self.ctx.cancel();
        self.client.shutdown().await;
        self.server.shutdown().await;
    }
}
