use std::convert::Infallible;

use tokio_stream::StreamExt;
use warp::Filter;
use warp::sse::Event;

use super::with_service;
use crate::models::TaskId;
use crate::service::{StreamEvent, TaskService};

pub fn sse_routes(service: TaskService) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path!("tasks" / String / "events")
    .and(warp::get())
    .and(with_service(service))
    .map(handle_events)
}

fn handle_events(task_id: String, service: TaskService) -> impl warp::Reply {
  let events = service
    .subscribe_events(TaskId::from(task_id))
    .map(|event| Ok::<_, Infallible>(to_sse(event)));
  warp::sse::reply(events)
}

fn to_sse(event: StreamEvent) -> Event {
  match event {
    StreamEvent::Event(event) => Event::default().event(event.name()).data(event.data().to_string()),
    StreamEvent::KeepAlive => Event::default().comment("ping"),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::messaging::TaskEvent;

  #[test]
  fn events_render_with_their_wire_names() {
    let rendered = to_sse(StreamEvent::Event(TaskEvent::Done)).to_string();
    assert!(rendered.contains("done"));
    assert!(rendered.contains("{}"));
    let ping = to_sse(StreamEvent::KeepAlive).to_string();
    assert!(ping.starts_with(':'));
    assert!(ping.contains("ping"));
  }
}
