use anyhow::Result;
use ember_script::{ScriptSession, SessionOptions};

fn new_session() -> Result<ScriptSession> {
    ScriptSession::new(SessionOptions::default())
}

fn session_with_player() -> Result<ScriptSession> {
    let session = new_session()?;
    session.join_player(0, "ember");
    Ok(session)
}

#[test]
fn scalars_round_trip_across_integer_widths() -> Result<()> {
    let session = session_with_player()?;
    session.load(
        r#"
            local p = player(0)
            p.tiny = 127
            p.tiny_neg = -128
            p.wide = 128
            p.wider = 32767
            p.widest = 40000
            p.floor = -2147483648
            p.flag = true
            p.off = false
            p.blob = "fox\0hound"
        "#,
        "fields.lua",
    )?;
    let bytes = session.archive()?;
    session.load(
        "player(0).tiny = 0 player(0).blob = 'overwritten'",
        "mutate.lua",
    )?;
    session.unarchive(&bytes)?;
    let ok: bool = session.eval(
        r#"
            local p = player(0)
            return p.tiny == 127 and p.tiny_neg == -128 and p.wide == 128
                and p.wider == 32767 and p.widest == 40000 and p.floor == -2147483648
                and p.flag == true and p.off == false and p.blob == "fox\0hound"
        "#,
    )?;
    assert!(ok, "restored player fields must match the archived values");
    Ok(())
}

#[test]
fn shared_and_cyclic_tables_keep_their_identity() -> Result<()> {
    let session = session_with_player()?;
    session.load(
        r#"
            local p = player(0)
            local shared = {count = 3}
            shared.self = shared
            p.left = shared
            p.right = shared
        "#,
        "cycle.lua",
    )?;
    let bytes = session.archive()?;

    // Two references, one body: the key "count" appears once on the wire.
    let needle = b"count";
    let bodies = bytes
        .windows(needle.len())
        .filter(|window| window == needle)
        .count();
    assert_eq!(bodies, 1, "a shared table must serialize exactly one body");

    session.unarchive(&bytes)?;
    let ok: bool = session.eval(
        r#"
            local p = player(0)
            return rawequal(p.left, p.right)
                and rawequal(p.left.self, p.left)
                and p.left.count == 3
        "#,
    )?;
    assert!(ok, "shared and cyclic references must reconstruct as one table");
    Ok(())
}

#[test]
fn empty_state_still_frames_slot_zero_and_the_sentinel() -> Result<()> {
    let session = new_session()?;
    let bytes = session.archive()?;
    assert_eq!(
        bytes.len(),
        6,
        "an empty archive is the slot-0 record plus the end-of-actors sentinel"
    );
    assert_eq!(&bytes[..2], &[0, 0], "slot 0 must emit a zero field count");
    assert_eq!(&bytes[2..], &[0xFF; 4], "the actor sentinel must close the stream");
    session.unarchive(&bytes)?;
    Ok(())
}

#[test]
fn actor_fields_restore_through_stable_ids() -> Result<()> {
    let session = new_session()?;
    session.load(
        r#"
            spawned = {}
            addHook("ActorSpawn", function(a) table.insert(spawned, a) end)
        "#,
        "spawn.lua",
    )?;
    session.spawn_actor(1);
    session.spawn_actor(2);
    session.load("spawned[1].rage = 5 spawned[2].rage = 9", "seed.lua")?;
    let bytes = session.archive()?;
    session.load("spawned[1].rage = 0 spawned[2].rage = 0", "mutate.lua")?;
    session.unarchive(&bytes)?;
    let ok: bool = session.eval("spawned[1].rage == 5 and spawned[2].rage == 9")?;
    assert!(ok, "actor fields must land back on the matching stable ids");
    Ok(())
}

#[test]
fn restoring_fields_for_a_missing_actor_is_fatal() -> Result<()> {
    let session = new_session()?;
    session.load(
        "addHook(\"ActorSpawn\", function(a) a.mark = true end)",
        "mark.lua",
    )?;
    let doomed = session.spawn_actor(1);
    let bytes = session.archive()?;
    session.despawn_actor(doomed);
    let err = session
        .unarchive(&bytes)
        .expect_err("an unmatched stable id must abort the load");
    assert!(
        format!("{err:#}").contains("not present in the world"),
        "unexpected failure: {err:#}"
    );
    Ok(())
}

#[test]
fn truncated_streams_abort_the_load() -> Result<()> {
    let session = session_with_player()?;
    session.load("player(0).name = 'longish payload'", "seed.lua")?;
    let bytes = session.archive()?;
    let err = session
        .unarchive(&bytes[..bytes.len() - 3])
        .expect_err("truncation must be fatal, not partially applied");
    assert!(
        format!("{err:#}").contains("ended mid-record"),
        "unexpected failure: {err:#}"
    );
    Ok(())
}

#[test]
fn net_vars_round_trip_through_the_archiver_closure() -> Result<()> {
    let session = new_session()?;
    session.load(
        r#"
            stash = {wins = 2, streak = {7, 9}}
            addHook("NetVars", function(net) stash = net(stash) end)
        "#,
        "netvars.lua",
    )?;
    let bytes = session.archive()?;
    session.load("stash = nil", "drop.lua")?;
    session.unarchive(&bytes)?;
    let ok: bool = session.eval(
        "stash.wins == 2 and stash.streak[1] == 7 and stash.streak[2] == 9",
    )?;
    assert!(ok, "NetVars state must survive the round trip");
    Ok(())
}

#[test]
fn registered_metatables_reattach_on_load() -> Result<()> {
    let session = session_with_player()?;
    session.load(
        r#"
            mt = {__index = function() return "fallback" end}
            registerMetatable(mt)
            player(0).gadget = setmetatable({kind = "lamp"}, mt)
        "#,
        "meta.lua",
    )?;
    let bytes = session.archive()?;
    session.unarchive(&bytes)?;
    let ok: bool = session.eval(
        r#"
            local g = player(0).gadget
            return rawequal(getmetatable(g), mt)
                and g.kind == "lamp" and g.missing == "fallback"
        "#,
    )?;
    assert!(ok, "the metatable id must resolve back to the registered table");
    Ok(())
}

#[test]
fn inline_vectors_deduplicate_by_identity() -> Result<()> {
    let session = session_with_player()?;
    session.load(
        r#"
            local v = vec3(1, 2, 3)
            player(0).pos = v
            player(0).vel = v
            player(0).spin = quaternion(0, 0, 0, 1)
        "#,
        "inline.lua",
    )?;
    let bytes = session.archive()?;
    session.unarchive(&bytes)?;
    let ok: bool = session.eval(
        r#"
            local p = player(0)
            return rawequal(p.pos, p.vel)
                and p.pos.x == 1 and p.pos.z == 3 and p.spin.w == 1
        "#,
    )?;
    assert!(ok, "one vector archived twice must come back as one userdata");
    Ok(())
}

#[test]
fn stale_actor_handles_archive_as_nil() -> Result<()> {
    let session = session_with_player()?;
    session.load(
        r#"
            marks = {}
            addHook("ActorSpawn", function(a) table.insert(marks, a) end)
        "#,
        "marks.lua",
    )?;
    let doomed = session.spawn_actor(3);
    session.spawn_actor(4);
    session.load(
        "player(0).doomed = marks[1] player(0).kept = marks[2]",
        "refs.lua",
    )?;
    session.despawn_actor(doomed);
    let bytes = session.archive()?;
    session.unarchive(&bytes)?;
    let ok: bool = session.eval(
        r#"
            local p = player(0)
            return p.doomed == nil and p.kept ~= nil and p.kept.kind == 4
        "#,
    )?;
    assert!(
        ok,
        "a despawned actor's handle must restore as nil, a live one as itself"
    );
    Ok(())
}

#[test]
fn unarchivable_values_become_nil_without_aborting() -> Result<()> {
    let session = session_with_player()?;
    session.load(
        r#"
            local p = player(0)
            p.ratio = 1.5
            p.huge = 2 ^ 40
            p.thunk = function() end
            p.keepme = "kept"
        "#,
        "soft.lua",
    )?;
    let bytes = session.archive()?;
    session.unarchive(&bytes)?;
    let ok: bool = session.eval(
        r#"
            local p = player(0)
            return p.ratio == nil and p.huge == nil and p.thunk == nil
                and p.keepme == "kept"
        "#,
    )?;
    assert!(ok, "unsupported values must soften to nil while the rest survive");
    Ok(())
}

#[test]
fn archives_round_trip_through_a_file() -> Result<()> {
    let session = session_with_player()?;
    {
        let world = session.world();
        world.borrow_mut().add_line(Some("GATE"));
    }
    session.load("player(0).gate = line(0)", "gate.lua")?;

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("resync.bin");
    std::fs::write(&path, session.archive()?)?;
    let bytes = std::fs::read(&path)?;
    session.unarchive(&bytes)?;
    let ok: bool = session.eval(
        "rawequal(player(0).gate, line(0)) and player(0).gate.trigger == 'GATE'",
    )?;
    assert!(ok, "native geometry refs must restore to the cached handle");
    Ok(())
}
