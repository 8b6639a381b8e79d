//! End-to-end scenarios over real abstract-namespace sockets.
//!
//! Every test runs a server router and a client router (or a raw scripted
//! peer) on one current-thread executor and asserts the per-endpoint event
//! order.

mod support;

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;
use pipemux::envelope::{RouteEnvelope, VERSION_MAJOR, VERSION_MINOR};
use pipemux::{
    Channel, ChannelEvent, ClientPipe, ClientRouter, GatewayEvent, RouteError, ServerPipe,
    ServerRouter, ServiceMessage, runtime, service,
};
use support::{Ping, Pong, Seen};
use tokio::io::AsyncWriteExt;
use tokio::task::spawn_local;

/// Gateway-level event record used where sequences matter.
#[derive(Debug, Clone, PartialEq, Eq)]
enum RawSeen {
    Connected,
    Message { sequence: u64, n: u32 },
    Completed(Option<RouteError>),
}

fn record_channel_events<I>(log: &support::Events<Seen>) -> impl FnMut(ChannelEvent<I>, &Channel<I, Ping>) + use<I>
where
    I: ServiceMessage + HasN,
{
    let log = Rc::clone(log);
    move |event, _channel| {
        log.borrow_mut().push(match event {
            ChannelEvent::Connected => Seen::Connected,
            ChannelEvent::Input(input) => Seen::Input(input.n()),
            ChannelEvent::Completed(error) => Seen::Completed(error),
        });
    }
}

trait HasN {
    fn n(&self) -> u32;
}

impl HasN for Ping {
    fn n(&self) -> u32 {
        self.n
    }
}

impl HasN for Pong {
    fn n(&self) -> u32 {
        self.n
    }
}

/// Register an echo service that replies once per input and keeps its
/// channel alive in `stash`.
fn register_echo(
    server: &ServerRouter,
    log: &support::Events<Seen>,
    stash: &Rc<RefCell<Option<Channel<Ping, Pong>>>>,
) {
    let log = Rc::clone(log);
    let stash = Rc::clone(stash);
    server
        .register_channel::<Ping, Pong, _>("echo", move |channel, input| {
            log.borrow_mut().push(Seen::Input(input.n));
            channel.send(&Pong { n: input.n }).expect("echo reply");
            let log = Rc::clone(&log);
            channel.subscribe(move |event, _channel| {
                log.borrow_mut().push(match event {
                    ChannelEvent::Connected => Seen::Connected,
                    ChannelEvent::Input(Ping { n }) => Seen::Input(n),
                    ChannelEvent::Completed(error) => Seen::Completed(error),
                });
            });
            *stash.borrow_mut() = Some(channel);
        })
        .expect("echo registration");
}

#[test]
fn handshake_connects_client_and_server() {
    support::init_logging();
    runtime::run(async {
        let address = support::unique_address("handshake");
        let server = ServerRouter::new(ServerPipe::new(address.clone()));
        server.start().expect("server start");

        let client = ClientRouter::new(ClientPipe::new(address));
        let events = support::events::<Seen>();
        let channel = client.make_channel::<Pong, Ping>("echo");
        channel.subscribe(record_channel_events(&events));
        client.start().expect("client start");

        support::wait_until("routing handshake", || client.is_connected()).await;
        support::wait_until("client registration", || server.client_count() == 1).await;
        support::wait_until("connected event", || !events.borrow().is_empty()).await;
        assert_eq!(events.borrow().first(), Some(&Seen::Connected));
    });
}

#[test]
fn factory_dispatch_echoes_and_client_drop_closes_gracefully() {
    support::init_logging();
    runtime::run(async {
        let address = support::unique_address("echo");
        let server = ServerRouter::new(ServerPipe::new(address.clone()));
        let server_events = support::events::<Seen>();
        let stash = Rc::new(RefCell::new(None));
        register_echo(&server, &server_events, &stash);
        server.start().expect("server start");

        let client = ClientRouter::new(ClientPipe::new(address));
        let client_events = support::events::<Seen>();
        let channel = client.make_channel::<Pong, Ping>("echo");
        {
            let client_events = Rc::clone(&client_events);
            channel.subscribe(move |event, channel| match event {
                ChannelEvent::Connected => {
                    client_events.borrow_mut().push(Seen::Connected);
                    channel.send(&Ping { n: 7 }).expect("request");
                }
                ChannelEvent::Input(Pong { n }) => client_events.borrow_mut().push(Seen::Input(n)),
                ChannelEvent::Completed(error) => {
                    client_events.borrow_mut().push(Seen::Completed(error));
                }
            });
        }
        client.start().expect("client start");

        support::wait_until("echo reply", || {
            client_events.borrow().contains(&Seen::Input(7))
        })
        .await;
        let invocations = server_events
            .borrow()
            .iter()
            .filter(|event| **event == Seen::Input(7))
            .count();
        assert_eq!(invocations, 1, "factory must run exactly once");
        assert_eq!(server.endpoint_count(), 1);

        // Graceful close propagates to the server and releases the endpoint.
        drop(channel);
        support::wait_until("server completion", || {
            server_events
                .borrow()
                .iter()
                .any(|event| *event == Seen::Completed(None))
        })
        .await;
        assert_eq!(server.endpoint_count(), 0);
    });
}

#[test]
fn pipe_disconnect_broadcasts_to_every_gateway() {
    support::init_logging();
    runtime::run(async {
        let address = support::unique_address("broadcast");
        let server = ServerRouter::new(ServerPipe::new(address.clone()));
        server.start().expect("server start");

        let client = ClientRouter::new(ClientPipe::new(address));
        let first_events = support::events::<Seen>();
        let second_events = support::events::<Seen>();
        let first = client.make_channel::<Pong, Ping>("one");
        let second = client.make_channel::<Pong, Ping>("two");
        first.subscribe(record_channel_events(&first_events));
        second.subscribe(record_channel_events(&second_events));
        client.start().expect("client start");

        support::wait_until("both gateways connected", || {
            first_events.borrow().contains(&Seen::Connected)
                && second_events.borrow().contains(&Seen::Connected)
        })
        .await;

        drop(server);

        let completed = |events: &support::Events<Seen>| {
            events
                .borrow()
                .iter()
                .filter(|event| matches!(event, Seen::Completed(_)))
                .count()
        };
        support::wait_until("both gateways completed", || {
            completed(&first_events) == 1 && completed(&second_events) == 1
        })
        .await;
        assert!(!client.is_connected());

        for events in [&first_events, &second_events] {
            let events = events.borrow();
            let error = events
                .iter()
                .find_map(|event| match event {
                    Seen::Completed(error) => Some(*error),
                    _ => None,
                })
                .expect("completion recorded");
            assert!(
                matches!(error, Some(RouteError::Canceled) | Some(RouteError::Io(_))),
                "unexpected completion error: {error:?}"
            );
        }

        // Nothing further may arrive after the terminal event.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(completed(&first_events), 1);
        assert_eq!(completed(&second_events), 1);
    });
}

#[test]
fn oversize_frame_completes_client_endpoints_with_invalid_argument() {
    support::init_logging();
    runtime::run(async {
        let address = support::unique_address("oversize-client");
        let listener = address.listen(5).expect("listen");
        spawn_local(async move {
            let mut stream = listener.accept().await.expect("accept");
            let reply = RouteEnvelope::Connect {
                major: VERSION_MAJOR,
                minor: VERSION_MINOR,
            };
            stream
                .write_all(&support::frame(&reply.encode()))
                .await
                .expect("write handshake");
            stream
                .write_all(&support::oversize_frame_header())
                .await
                .expect("write oversize header");
            // Hold the socket open; the client must fail on the header, not
            // on EOF.
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let client = ClientRouter::new(ClientPipe::new(address));
        let events = support::events::<Seen>();
        let channel = client.make_channel::<Pong, Ping>("echo");
        channel.subscribe(record_channel_events(&events));
        client.start().expect("client start");

        support::wait_until("invalid-argument completion", || {
            events
                .borrow()
                .contains(&Seen::Completed(Some(RouteError::InvalidArgument)))
        })
        .await;
        assert!(!client.is_connected());
        assert_eq!(
            *events.borrow(),
            vec![
                Seen::Connected,
                Seen::Completed(Some(RouteError::InvalidArgument)),
            ],
        );
        drop(channel);
    });
}

#[test]
fn oversize_frame_drops_the_offending_server_client() {
    support::init_logging();
    runtime::run(async {
        let address = support::unique_address("oversize-server");
        let server = ServerRouter::new(ServerPipe::new(address.clone()));
        let server_events = support::events::<Seen>();
        let stash = Rc::new(RefCell::new(None));
        register_echo(&server, &server_events, &stash);
        server.start().expect("server start");

        let mut stream = address.connect().await.expect("raw connect");
        let connect = RouteEnvelope::Connect {
            major: VERSION_MAJOR,
            minor: VERSION_MINOR,
        };
        stream
            .write_all(&support::frame(&connect.encode()))
            .await
            .expect("write handshake");

        let request = RouteEnvelope::ChannelMsg {
            service_id: service::service_id("echo", Ping::TYPE_NAME),
            tag: 1,
            sequence: 0,
        };
        let mut payload = request.encode().to_vec();
        payload.extend_from_slice(&Ping { n: 3 }.encode().expect("encode request"));
        stream
            .write_all(&support::frame(&payload))
            .await
            .expect("write request");

        support::wait_until("factory dispatch", || {
            server_events.borrow().contains(&Seen::Input(3))
        })
        .await;
        assert_eq!(server.endpoint_count(), 1);

        stream
            .write_all(&support::oversize_frame_header())
            .await
            .expect("write oversize header");

        support::wait_until("endpoint completion", || {
            server_events
                .borrow()
                .contains(&Seen::Completed(Some(RouteError::InvalidArgument)))
        })
        .await;
        assert_eq!(server.client_count(), 0);
        assert_eq!(server.endpoint_count(), 0);
    });
}

#[test]
fn reentrant_sends_from_a_handler_arrive_in_order() {
    support::init_logging();
    runtime::run(async {
        let address = support::unique_address("reentrant");
        let server = ServerRouter::new(ServerPipe::new(address.clone()));
        let stash = Rc::new(RefCell::new(None));
        {
            let stash = Rc::clone(&stash);
            server
                .register_channel::<Ping, Pong, _>("echo", move |channel, input| {
                    for offset in 0..3 {
                        channel
                            .send(&Pong { n: input.n + offset })
                            .expect("burst reply");
                    }
                    *stash.borrow_mut() = Some(channel);
                })
                .expect("echo registration");
        }
        server.start().expect("server start");

        let client = ClientRouter::new(ClientPipe::new(address));
        let events = support::events::<RawSeen>();
        let gateway = client.make_gateway();
        {
            let events = Rc::clone(&events);
            gateway.subscribe(Box::new(move |event| {
                events.borrow_mut().push(match event {
                    GatewayEvent::Connected => RawSeen::Connected,
                    GatewayEvent::Message { sequence, payload } => RawSeen::Message {
                        sequence,
                        n: Pong::decode(&payload).map_or(0, |pong| pong.n),
                    },
                    GatewayEvent::Completed { error } => RawSeen::Completed(error),
                });
            }));
        }
        client.start().expect("client start");

        support::wait_until("routing handshake", || client.is_connected()).await;
        let request = Ping { n: 5 }.encode().expect("encode request");
        gateway
            .send(
                service::service_id("echo", Ping::TYPE_NAME),
                Bytes::from(request),
            )
            .expect("send request");

        support::wait_until("three replies", || {
            events
                .borrow()
                .iter()
                .filter(|event| matches!(event, RawSeen::Message { .. }))
                .count()
                == 3
        })
        .await;

        let messages: Vec<RawSeen> = events
            .borrow()
            .iter()
            .filter(|event| matches!(event, RawSeen::Message { .. }))
            .cloned()
            .collect();
        assert_eq!(
            messages,
            vec![
                RawSeen::Message { sequence: 0, n: 5 },
                RawSeen::Message { sequence: 1, n: 6 },
                RawSeen::Message { sequence: 2, n: 7 },
            ],
        );
    });
}

#[test]
fn duplicate_handshake_reply_is_ignored_and_channel_end_is_terminal() {
    support::init_logging();
    runtime::run(async {
        let address = support::unique_address("terminal");
        let listener = address.listen(5).expect("listen");
        spawn_local(async move {
            let mut stream = listener.accept().await.expect("accept");
            let reply = RouteEnvelope::Connect {
                major: VERSION_MAJOR,
                minor: VERSION_MINOR,
            };
            // The second reply must not produce a second Connected event.
            for _ in 0..2 {
                stream
                    .write_all(&support::frame(&reply.encode()))
                    .await
                    .expect("write handshake");
            }

            let end = RouteEnvelope::ChannelEnd {
                tag: 1,
                error_code: 0,
            };
            stream
                .write_all(&support::frame(&end.encode()))
                .await
                .expect("write channel end");

            // A message for the ended endpoint is unsolicited and must be
            // dropped silently.
            let stale = RouteEnvelope::ChannelMsg {
                service_id: 9,
                tag: 1,
                sequence: 0,
            };
            let mut payload = stale.encode().to_vec();
            payload.extend_from_slice(b"stale");
            stream
                .write_all(&support::frame(&payload))
                .await
                .expect("write stale message");
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let client = ClientRouter::new(ClientPipe::new(address));
        let events = support::events::<RawSeen>();
        let gateway = client.make_gateway();
        {
            let events = Rc::clone(&events);
            gateway.subscribe(Box::new(move |event| {
                events.borrow_mut().push(match event {
                    GatewayEvent::Connected => RawSeen::Connected,
                    GatewayEvent::Message { sequence, .. } => RawSeen::Message { sequence, n: 0 },
                    GatewayEvent::Completed { error } => RawSeen::Completed(error),
                });
            }));
        }
        client.start().expect("client start");

        support::wait_until("terminal completion", || {
            events.borrow().contains(&RawSeen::Completed(None))
        })
        .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            *events.borrow(),
            vec![RawSeen::Connected, RawSeen::Completed(None)],
        );
        assert_eq!(client.endpoint_count(), 0);
    });
}

#[test]
fn cancellation_completes_both_sides() {
    support::init_logging();
    runtime::run(async {
        let address = support::unique_address("cancel");
        let server = ServerRouter::new(ServerPipe::new(address.clone()));
        let server_events = support::events::<Seen>();
        let stash = Rc::new(RefCell::new(None));
        register_echo(&server, &server_events, &stash);
        server.start().expect("server start");

        let client = ClientRouter::new(ClientPipe::new(address));
        let client_events = support::events::<Seen>();
        let channel = client.make_channel::<Pong, Ping>("echo");
        {
            let client_events = Rc::clone(&client_events);
            channel.subscribe(move |event, channel| match event {
                ChannelEvent::Connected => {
                    client_events.borrow_mut().push(Seen::Connected);
                    channel.send(&Ping { n: 1 }).expect("request");
                }
                ChannelEvent::Input(Pong { n }) => client_events.borrow_mut().push(Seen::Input(n)),
                ChannelEvent::Completed(error) => {
                    client_events.borrow_mut().push(Seen::Completed(error));
                }
            });
        }
        client.start().expect("client start");

        support::wait_until("echo reply", || {
            client_events.borrow().contains(&Seen::Input(1))
        })
        .await;

        channel.complete(Some(RouteError::Canceled));
        assert!(
            client_events
                .borrow()
                .contains(&Seen::Completed(Some(RouteError::Canceled))),
            "local completion is synchronous"
        );
        assert_eq!(client.endpoint_count(), 0);

        support::wait_until("peer completion", || {
            server_events
                .borrow()
                .contains(&Seen::Completed(Some(RouteError::Canceled)))
        })
        .await;
        assert_eq!(server.endpoint_count(), 0);
    });
}
