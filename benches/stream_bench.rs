use criterion::{black_box, criterion_group, criterion_main, Criterion};
use keyed_ecs::prelude::*;

#[derive(Debug, Clone, Copy)]
struct Position {
    x: f32,
    y: f32,
}

#[derive(Debug, Clone, Copy)]
struct Velocity {
    x: f32,
    y: f32,
}

#[derive(Debug, Clone, Copy)]
struct Likes(u32);

fn populated_world(count: usize) -> World {
    let mut world = World::new();
    let entities = world.spawn_n(count);
    for (i, &e) in entities.iter().enumerate() {
        world
            .add_component(
                e,
                Identity::NONE,
                Position {
                    x: i as f32,
                    y: 0.0,
                },
            )
            .unwrap();
        world
            .add_component(e, Identity::NONE, Velocity { x: 1.0, y: 1.0 })
            .unwrap();
    }
    world
}

fn bench_spawn(c: &mut Criterion) {
    c.bench_function("spawn_10k", |b| {
        b.iter(|| {
            let mut world = World::new();
            black_box(world.spawn_n(10_000));
        });
    });
}

fn bench_add_component(c: &mut Criterion) {
    c.bench_function("add_component_10k", |b| {
        b.iter(|| {
            let mut world = World::new();
            for e in world.spawn_n(10_000) {
                world.add_component(e, Identity::NONE, Position { x: 0.0, y: 0.0 }).unwrap();
            }
            black_box(world.archetype_count());
        });
    });
}

fn bench_stream_sequential(c: &mut Criterion) {
    let mut world = populated_world(100_000);
    c.bench_function("stream_for_each_100k", |b| {
        b.iter(|| {
            world.stream::<(Position, Velocity)>().for_each(|_, pos, vel| {
                pos.x += vel.x;
                pos.y += vel.y;
            });
        });
    });
}

fn bench_stream_wildcard(c: &mut Criterion) {
    let mut world = World::new();
    let targets: Vec<_> = (0..4).map(|_| world.spawn()).collect();
    let entities = world.spawn_n(10_000);
    for &e in &entities {
        for &t in &targets {
            world.add_component(e, t, Likes(1)).unwrap();
        }
    }
    c.bench_function("stream_wildcard_cross_join_10kx4", |b| {
        b.iter(|| {
            let total = world
                .query::<(Likes,)>()
                .matching(0, Identity::ANY_ENTITY)
                .compile()
                .for_each_uniform(0u64, |acc, _, likes| *acc += likes.0 as u64);
            black_box(total);
        });
    });
}

#[cfg(feature = "parallel")]
fn bench_stream_parallel(c: &mut Criterion) {
    let mut world = populated_world(100_000);
    c.bench_function("stream_parallel_100k", |b| {
        b.iter(|| {
            world.stream::<(Position, Velocity)>().parallel(
                |_, pos, vel| {
                    pos.x += vel.x;
                    pos.y += vel.y;
                },
                Some(4096),
            );
        });
    });
}

#[cfg(feature = "parallel")]
criterion_group!(
    benches,
    bench_spawn,
    bench_add_component,
    bench_stream_sequential,
    bench_stream_wildcard,
    bench_stream_parallel
);

#[cfg(not(feature = "parallel"))]
criterion_group!(
    benches,
    bench_spawn,
    bench_add_component,
    bench_stream_sequential,
    bench_stream_wildcard
);

criterion_main!(benches);
