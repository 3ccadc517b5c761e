use keyed_ecs::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Position {
    x: f32,
    y: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Velocity {
    x: f32,
    y: f32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct A(i64);

#[derive(Debug, Clone, Copy, PartialEq)]
struct B(i64);

#[test]
fn test_basic_spawn_add_query() -> Result<()> {
    let mut world = World::new();

    let e1 = world.spawn();
    let e2 = world.spawn();
    let e3 = world.spawn();

    world.add_component(e1, Identity::NONE, Position { x: 1.0, y: 1.0 })?;
    world.add_component(e2, Identity::NONE, Position { x: 2.0, y: 2.0 })?;
    world.add_component(e3, Identity::NONE, Position { x: 3.0, y: 3.0 })?;
    world.add_component(e3, Identity::NONE, Velocity { x: 1.0, y: 0.0 })?;

    let mut positions = Vec::new();
    world.stream::<(Position,)>().for_each(|_, pos| {
        positions.push(*pos);
    });
    assert_eq!(positions.len(), 3);
    for expected in [
        Position { x: 1.0, y: 1.0 },
        Position { x: 2.0, y: 2.0 },
        Position { x: 3.0, y: 3.0 },
    ] {
        assert!(positions.contains(&expected));
    }

    let mut hits = Vec::new();
    world
        .stream::<(Position, Velocity)>()
        .for_each(|entity, pos, vel| {
            hits.push((entity, *pos, *vel));
        });
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].0, e3);
    assert_eq!(hits[0].1, Position { x: 3.0, y: 3.0 });
    assert_eq!(hits[0].2, Velocity { x: 1.0, y: 0.0 });
    Ok(())
}

#[test]
fn test_migration_and_backfill_sum() -> Result<()> {
    let mut world = World::new();

    let entities = world.spawn_n(1000);
    for (i, &e) in entities.iter().enumerate() {
        world.add_component(e, Identity::NONE, A(i as i64))?;
    }
    for (i, &e) in entities.iter().enumerate() {
        if i % 2 == 1 {
            world.add_component(e, Identity::NONE, B(2 * i as i64))?;
        }
    }

    // Odd-indexed entities migrated out of {A} into {A, B}
    let a_only = world
        .archetypes()
        .iter()
        .find(|arch| arch.signature().len() == 1 && arch.len() == 500);
    assert!(a_only.is_some());
    let a_b = world
        .archetypes()
        .iter()
        .find(|arch| arch.signature().len() == 2 && arch.len() == 500);
    assert!(a_b.is_some());

    let sum = world
        .stream::<(A, B)>()
        .for_each_uniform(0i64, |acc, _, _, b| *acc += b.0);
    assert_eq!(sum, 500_000);
    Ok(())
}

#[test]
fn test_values_survive_migration() -> Result<()> {
    let mut world = World::new();
    let entities = world.spawn_n(64);
    for (i, &e) in entities.iter().enumerate() {
        world.add_component(e, Identity::NONE, A(i as i64))?;
    }
    // Back-and-forth migration must not disturb A values
    for &e in &entities {
        world.add_component(e, Identity::NONE, B(0))?;
    }
    for &e in &entities {
        world.remove_component::<B>(e, Identity::NONE)?;
    }
    for (i, &e) in entities.iter().enumerate() {
        assert_eq!(
            *world.get_component::<A>(e, Identity::NONE)?,
            A(i as i64)
        );
    }
    Ok(())
}

#[test]
fn test_any_group() -> Result<()> {
    let mut world = World::new();
    for i in 0..9 {
        let e = world.spawn();
        world.add_component(e, Identity::NONE, Position { x: 0.0, y: 0.0 })?;
        match i % 3 {
            0 => world.add_component(e, Identity::NONE, A(0))?,
            1 => world.add_component(e, Identity::NONE, B(0))?,
            _ => {}
        }
    }

    // Position plus at least one of {A, B}
    let count = world
        .query::<(Position,)>()
        .any::<A>()
        .any::<B>()
        .compile()
        .count();
    assert_eq!(count, 6);
    Ok(())
}

#[test]
fn test_stream_blit() -> Result<()> {
    let mut world = World::new();
    for _ in 0..10 {
        let e = world.spawn();
        world.add_component(e, Identity::NONE, A(1))?;
    }
    for _ in 0..5 {
        let e = world.spawn();
        world.add_component(e, Identity::NONE, A(1))?;
        world.add_component(e, Identity::NONE, B(0))?;
    }

    // Blit hits every matched archetype
    world.stream::<(A,)>().blit(A(3), Identity::NONE);
    let sum = world
        .stream::<(A,)>()
        .for_each_uniform(0i64, |acc, _, a| *acc += a.0);
    assert_eq!(sum, 45);
    Ok(())
}
