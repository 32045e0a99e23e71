//! Integration tests for inbound request dispatch.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use rpc_core::rpc::frame::{ERR_BAD_REQUEST, ERR_FORBIDDEN, ERR_NOT_FOUND};
use serde::Deserialize;
use serde_json::json;

use crate::mock_channel::{deliver, engine_with_default};

#[derive(Deserialize)]
struct AddArgs {
    a: i64,
    b: i64,
}

#[test]
fn math_add_round_trip() {
    let (engine, ch, cid) = engine_with_default("dev1");
    engine.add_handler("Math.Add", "{a: %d, b: %d}", |ri, _fi, args| {
        let sum = match rpc_core::rpc::frame::decode_payload::<AddArgs>(args) {
            Ok(AddArgs { a, b }) => a + b,
            Err(_) => {
                ri.send_error(ERR_BAD_REQUEST, Some("a and b are required")).unwrap();
                return;
            }
        };
        ri.send_response(Some(json!({ "sum": sum }))).unwrap();
    });

    deliver(
        &engine,
        cid,
        &json!({"v": 2, "id": 11, "src": "cloud", "dst": "dev1", "tag": "t7",
                "method": "Math.Add", "args": {"a": 2, "b": 3}}),
    );

    let resp = ch.last_sent().unwrap();
    assert_eq!(resp["id"], 11);
    assert_eq!(resp["src"], "dev1");
    assert_eq!(resp["dst"], "cloud");
    assert_eq!(resp["tag"], "t7");
    assert_eq!(resp["result"], json!({"sum": 5}));
    assert!(resp.get("error").is_none());
    assert_eq!(engine.inbound_in_flight(), 0);
}

#[test]
fn bad_args_produce_error_response() {
    let (engine, ch, cid) = engine_with_default("dev1");
    engine.add_handler("Math.Add", "{a: %d, b: %d}", |ri, _fi, args| {
        match rpc_core::rpc::frame::decode_payload::<AddArgs>(args) {
            Ok(AddArgs { a, b }) => ri.send_response(Some(json!(a + b))).unwrap(),
            Err(_) => ri.send_error(ERR_BAD_REQUEST, Some("a and b are required")).unwrap(),
        }
    });

    deliver(&engine, cid, &json!({"id": 3, "method": "Math.Add", "args": {"a": 1}}));
    let resp = ch.last_sent().unwrap();
    assert_eq!(resp["error"], json!({"code": 400, "message": "a and b are required"}));
    assert!(resp.get("result").is_none());
}

#[test]
fn unknown_method_gets_404_and_no_handler_runs() {
    let (engine, ch, cid) = engine_with_default("dev1");
    let ran = Rc::new(Cell::new(false));
    let flag = Rc::clone(&ran);
    engine.add_handler("Known", "", move |ri, _fi, _args| {
        flag.set(true);
        ri.free();
    });

    deliver(&engine, cid, &json!({"id": 4, "src": "cloud", "method": "Nope.Missing"}));

    assert!(!ran.get());
    let resp = ch.last_sent().unwrap();
    assert_eq!(resp["id"], 4);
    assert_eq!(resp["error"]["code"], ERR_NOT_FOUND);
    assert_eq!(resp["error"]["message"], "No handler for Nope.Missing");
}

#[test]
fn error_json_message_is_serialised_string() {
    let (engine, ch, cid) = engine_with_default("dev1");
    engine.add_handler("FS.Get", "", |ri, _fi, _args| {
        ri.send_error_json(500, &json!({"errno": 2})).unwrap();
    });

    deliver(&engine, cid, &json!({"id": 8, "method": "FS.Get"}));
    let resp = ch.last_sent().unwrap();
    assert_eq!(resp["error"]["code"], 500);
    assert_eq!(resp["error"]["message"], r#"{"errno":2}"#);
}

#[test]
fn notification_gets_no_response() {
    let (engine, ch, cid) = engine_with_default("dev1");
    let hits = Rc::new(Cell::new(0));
    let h = Rc::clone(&hits);
    engine.add_handler("Log.Event", "", move |ri, _fi, _args| {
        h.set(h.get() + 1);
        assert!(ri.send_response(Some(json!(true))).is_ok());
    });

    deliver(&engine, cid, &json!({"method": "Log.Event"}));
    assert_eq!(hits.get(), 1);
    assert!(ch.sent().is_empty());
    assert_eq!(engine.inbound_in_flight(), 0);
}

#[test]
fn frame_info_reports_channel_trust() {
    let (engine, _ch, cid) = engine_with_default("dev1");
    let seen = Rc::new(RefCell::new(None));
    let s = Rc::clone(&seen);
    engine.add_handler("Who", "", move |ri, fi, _args| {
        *s.borrow_mut() = Some((fi.channel_type.to_owned(), fi.channel_is_trusted));
        ri.free();
    });

    deliver(&engine, cid, &json!({"id": 1, "method": "Who"}));
    assert_eq!(*seen.borrow(), Some(("mock".to_owned(), true)));
}

#[test]
fn prehandler_veto_suppresses_handler_and_response() {
    let (engine, ch, cid) = engine_with_default("dev1");
    let ran = Rc::new(Cell::new(false));
    let flag = Rc::clone(&ran);
    engine.add_handler("Sys.Reboot", "", move |ri, _fi, _args| {
        flag.set(true);
        ri.free();
    });
    engine.set_prehandler(|ri, _fi, _args| {
        if ri.method == "Sys.Reboot" {
            ri.free();
            None
        } else {
            Some(ri)
        }
    });

    deliver(&engine, cid, &json!({"id": 2, "method": "Sys.Reboot"}));
    assert!(!ran.get());
    assert!(ch.sent().is_empty());
}

#[test]
fn prehandler_may_answer_on_veto() {
    let (engine, ch, cid) = engine_with_default("dev1");
    engine.add_handler("Sys.Reboot", "", |ri, _fi, _args| ri.free());
    engine.set_prehandler(|ri, fi, _args| {
        if fi.channel_is_trusted && ri.authn.username.is_some() {
            return Some(ri);
        }
        ri.send_error(ERR_FORBIDDEN, Some("forbidden")).unwrap();
        None
    });

    deliver(&engine, cid, &json!({"id": 6, "method": "Sys.Reboot"}));
    let sent = ch.sent();
    assert_eq!(sent.len(), 1, "exactly one response");
    assert_eq!(sent[0]["error"]["code"], ERR_FORBIDDEN);
}

#[test]
fn prehandler_pass_through_and_clear() {
    let (engine, ch, cid) = engine_with_default("dev1");
    let pre_hits = Rc::new(Cell::new(0));
    let p = Rc::clone(&pre_hits);
    engine.add_handler("Echo", "", |ri, _fi, args| {
        let v: serde_json::Value = rpc_core::rpc::frame::decode_payload(args).unwrap();
        ri.send_response(Some(v)).unwrap();
    });
    engine.set_prehandler(move |ri, _fi, _args| {
        p.set(p.get() + 1);
        Some(ri)
    });

    deliver(&engine, cid, &json!({"id": 1, "method": "Echo", "args": [1, 2]}));
    assert_eq!(pre_hits.get(), 1);
    assert_eq!(ch.last_sent().unwrap()["result"], json!([1, 2]));

    engine.clear_prehandler();
    deliver(&engine, cid, &json!({"id": 2, "method": "Echo"}));
    assert_eq!(pre_hits.get(), 1);
    assert_eq!(ch.last_sent().unwrap()["result"], json!({}));
}

#[test]
fn unknown_method_bypasses_prehandler() {
    let (engine, ch, cid) = engine_with_default("dev1");
    let pre_hits = Rc::new(Cell::new(0));
    let p = Rc::clone(&pre_hits);
    engine.set_prehandler(move |ri, _fi, _args| {
        p.set(p.get() + 1);
        Some(ri)
    });

    deliver(&engine, cid, &json!({"id": 1, "method": "Nope"}));
    assert_eq!(pre_hits.get(), 0);
    assert_eq!(ch.last_sent().unwrap()["error"]["code"], ERR_NOT_FOUND);
}

#[test]
fn later_registration_replaces_handler() {
    let (engine, ch, cid) = engine_with_default("dev1");
    engine.add_handler("Sys.GetInfo", "", |ri, _fi, _args| {
        ri.send_response(Some(json!("old"))).unwrap();
    });
    engine.add_handler("Sys.GetInfo", "", |ri, _fi, _args| {
        ri.send_response(Some(json!("new"))).unwrap();
    });

    deliver(&engine, cid, &json!({"id": 1, "method": "Sys.GetInfo"}));
    assert_eq!(ch.last_sent().unwrap()["result"], "new");
    assert_eq!(engine.method_names(), vec!["Sys.GetInfo"]);
}

#[test]
fn introspection_methods() {
    let (engine, ch, cid) = engine_with_default("dev1");
    engine.add_handler("Math.Add", "{a: %d, b: %d}", |ri, _fi, _args| ri.free());
    engine.add_list_handler();

    deliver(&engine, cid, &json!({"id": 1, "method": "RPC.List"}));
    let names = ch.last_sent().unwrap()["result"].clone();
    assert_eq!(names, json!(["Math.Add", "RPC.List", "RPC.Describe", "RPC.Ping"]));

    deliver(&engine, cid, &json!({"id": 2, "method": "RPC.Describe", "args": {"name": "Math.Add"}}));
    assert_eq!(
        ch.last_sent().unwrap()["result"],
        json!({"name": "Math.Add", "args_fmt": "{a: %d, b: %d}"})
    );

    deliver(&engine, cid, &json!({"id": 3, "method": "RPC.Describe", "args": {"name": "X"}}));
    assert_eq!(ch.last_sent().unwrap()["error"]["code"], ERR_NOT_FOUND);

    deliver(&engine, cid, &json!({"id": 4, "method": "RPC.Describe"}));
    assert_eq!(ch.last_sent().unwrap()["error"]["code"], ERR_BAD_REQUEST);

    deliver(&engine, cid, &json!({"id": 5, "method": "RPC.Ping"}));
    assert_eq!(ch.last_sent().unwrap()["result"], "pong");
}

#[test]
fn malformed_frames_never_reach_handlers() {
    let (engine, ch, cid) = engine_with_default("dev1");
    let ran = Rc::new(Cell::new(false));
    let flag = Rc::clone(&ran);
    engine.add_handler("M", "", move |ri, _fi, _args| {
        flag.set(true);
        ri.free();
    });

    for bad in [&b"garbage"[..], br#"{"method":"M","id":1,"result":1}"#, br#"{"v":2}"#] {
        engine.channel_event(cid, rpc_core::rpc::channel::ChannelEvent::FrameReceived(bad));
    }
    assert!(!ran.get());
    assert!(ch.sent().is_empty());
}

#[test]
fn frames_for_other_destinations_are_dropped() {
    let (engine, ch, cid) = engine_with_default("dev1");
    let ran = Rc::new(Cell::new(false));
    let flag = Rc::clone(&ran);
    engine.add_handler("M", "", move |ri, _fi, _args| {
        flag.set(true);
        ri.free();
    });

    deliver(&engine, cid, &json!({"id": 1, "dst": "dev2", "method": "M"}));
    assert!(!ran.get());
    assert!(ch.sent().is_empty());

    deliver(&engine, cid, &json!({"id": 2, "dst": "dev1", "method": "M"}));
    assert!(ran.get());
}

#[test]
fn listing_requires_a_trusted_channel() {
    use rpc_core::config::RpcConfig;
    use rpc_core::rpc::channel::ChannelEvent;
    use rpc_core::rpc::engine::RpcEngine;

    let engine = RpcEngine::new(RpcConfig::with_id("dev1"));
    let ch = Rc::new(crate::mock_channel::MockChannel::new());
    let cid = engine.add_channel("*", ch.clone(), false).unwrap();
    engine.channel_event(cid, ChannelEvent::Open);
    engine.add_list_handler();

    deliver(&engine, cid, &json!({"id": 1, "method": "RPC.List"}));
    assert_eq!(ch.last_sent().unwrap()["error"]["code"], ERR_FORBIDDEN);

    deliver(&engine, cid, &json!({"id": 2, "method": "RPC.Describe", "args": {"name": "RPC.Ping"}}));
    assert_eq!(ch.last_sent().unwrap()["error"]["code"], ERR_FORBIDDEN);

    deliver(&engine, cid, &json!({"id": 3, "method": "RPC.Ping"}));
    assert_eq!(ch.last_sent().unwrap()["result"], "pong");
}
