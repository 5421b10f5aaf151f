//! RabbitMQ broker client backed by `lapin`.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, ConfirmSelectOptions, QueueDeclareOptions, QueueDeleteOptions,
    },
    types::{AMQPValue, FieldTable},
    uri::{AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo},
    BasicProperties, Connection, ConnectionProperties,
};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::{
    Broker, BrokerChannel, BrokerConnection, ConnectArguments, ConnectionErrorHandler,
    IncomingDelivery, ReturnedMessage, SignalSink,
};
use crate::{
    channel::{BasicConsumeArguments, BasicPublishArguments, MessageProperties, QueueDeclareArguments},
    error::Error,
    Result,
};

const REPLY_SUCCESS: u16 = 200;
const DELIVERY_MODE_PERSISTENT: u8 = 2;

/////////////////////////////////////////////////////////////////////////////
/// Broker client for RabbitMQ, registered under the `rabbitmq` type key.
#[derive(Debug, Clone, Copy, Default)]
pub struct LapinBroker;

impl LapinBroker {
    fn uri(args: &ConnectArguments) -> AMQPUri {
        AMQPUri {
            scheme: AMQPScheme::AMQP,
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: args.username.clone(),
                    password: args.password.clone(),
                },
                host: args.host.clone(),
                port: args.port,
            },
            vhost: args.virtual_host.clone(),
            query: AMQPQueryString {
                heartbeat: Some(args.heartbeat),
                ..Default::default()
            },
        }
    }
}

#[async_trait]
impl Broker for LapinBroker {
    async fn connect(&self, args: &ConnectArguments) -> Result<Arc<dyn BrokerConnection>> {
        // run lapin on the tokio runtime of the caller
        let mut properties = ConnectionProperties::default()
            .with_executor(tokio_executor_trait::Tokio::current());
        #[cfg(unix)]
        {
            properties = properties.with_reactor(tokio_reactor_trait::Tokio);
        }
        if let Some(name) = &args.connection_name {
            properties = properties.with_connection_name(name.clone().into());
        }
        let connection = Connection::connect_uri(Self::uri(args), properties)
            .await
            .map_err(|err| Error::ConnectionOpenError(err.to_string()))?;
        debug!(host = %args.host, port = args.port, "lapin connection established");
        Ok(Arc::new(LapinConnection { inner: connection }))
    }
}

/////////////////////////////////////////////////////////////////////////////
struct LapinConnection {
    inner: Connection,
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    async fn open_channel(&self, signals: SignalSink) -> Result<Arc<dyn BrokerChannel>> {
        let channel = self
            .inner
            .create_channel()
            .await
            .map_err(|err| Error::ChannelOpenError(err.to_string()))?;
        // publisher confirms carry the basic.return of mandatory messages
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|err| Error::ChannelOpenError(err.to_string()))?;

        let sink = signals.clone();
        channel.on_error(move |err| {
            sink.error(err.into());
            sink.closed();
        });
        Ok(Arc::new(LapinChannel {
            inner: channel,
            signals,
        }))
    }

    fn on_error(&self, handler: ConnectionErrorHandler) {
        let handler = Mutex::new(Some(handler));
        self.inner.on_error(move |err| {
            let handler = match handler.lock() {
                Ok(mut guard) => guard.take(),
                Err(poisoned) => poisoned.into_inner().take(),
            };
            if let Some(handler) = handler {
                handler(err.into());
            }
        });
    }

    async fn close(&self) -> Result<()> {
        self.inner
            .close(REPLY_SUCCESS, "closed by client")
            .await
            .map_err(|err| Error::ConnectionCloseError(err.to_string()))
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }
}

/////////////////////////////////////////////////////////////////////////////
struct LapinChannel {
    inner: lapin::Channel,
    signals: SignalSink,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn queue_declare(&self, args: &QueueDeclareArguments) -> Result<()> {
        let options = QueueDeclareOptions {
            durable: args.durable,
            exclusive: args.exclusive,
            auto_delete: args.auto_delete,
            ..Default::default()
        };
        let mut arguments = FieldTable::default();
        if let Some(ttl) = args.message_ttl {
            arguments.insert("x-message-ttl".into(), AMQPValue::LongUInt(ttl));
        }
        self.inner
            .queue_declare(&args.queue, options, arguments)
            .await?;
        Ok(())
    }

    async fn queue_delete(&self, queue: &str) -> Result<()> {
        self.inner
            .queue_delete(queue, QueueDeleteOptions::default())
            .await?;
        Ok(())
    }

    async fn basic_publish(
        &self,
        args: &BasicPublishArguments,
        properties: &MessageProperties,
        content: Vec<u8>,
    ) -> Result<()> {
        let mut basic_properties = BasicProperties::default();
        if let Some(message_id) = &properties.message_id {
            basic_properties = basic_properties.with_message_id(message_id.as_str().into());
        }
        if let Some(timestamp) = properties.timestamp {
            basic_properties = basic_properties.with_timestamp(timestamp);
        }
        if let Some(content_type) = &properties.content_type {
            basic_properties = basic_properties.with_content_type(content_type.as_str().into());
        }
        if let Some(app_id) = &properties.app_id {
            basic_properties = basic_properties.with_app_id(app_id.as_str().into());
        }
        if properties.persistent {
            basic_properties = basic_properties.with_delivery_mode(DELIVERY_MODE_PERSISTENT);
        }

        let options = BasicPublishOptions {
            mandatory: args.mandatory,
            ..Default::default()
        };
        let confirmation = self
            .inner
            .basic_publish(
                &args.exchange,
                &args.routing_key,
                options,
                &content,
                basic_properties,
            )
            .await?
            .await?;

        if confirmation.is_nack() {
            return Err(Error::NetworkError(format!(
                "broker rejected message for {}",
                args.routing_key
            )));
        }
        if let Some(returned) = confirmation.take_message() {
            let message_id = returned
                .delivery
                .properties
                .message_id()
                .as_ref()
                .map(|id| id.to_string());
            self.signals.returned(ReturnedMessage {
                queue: args.routing_key.clone(),
                reply_code: returned.reply_code,
                reply_text: returned.reply_text.to_string(),
                message_id,
                content: returned.delivery.data,
            });
        }
        Ok(())
    }

    async fn basic_consume(
        &self,
        args: &BasicConsumeArguments,
    ) -> Result<mpsc::UnboundedReceiver<IncomingDelivery>> {
        let options = BasicConsumeOptions {
            no_ack: args.no_ack,
            ..Default::default()
        };
        let mut consumer = self
            .inner
            .basic_consume(&args.queue, &args.consumer_tag, options, FieldTable::default())
            .await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let consumer_tag = args.consumer_tag.clone();
        tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                match delivery {
                    Ok(delivery) => {
                        let incoming = IncomingDelivery {
                            delivery_tag: delivery.delivery_tag,
                            message_id: delivery
                                .properties
                                .message_id()
                                .as_ref()
                                .map(|id| id.to_string()),
                            redelivered: delivery.redelivered,
                            content: delivery.data,
                        };
                        if tx.send(incoming).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(consumer_tag = %consumer_tag, "consumer stream failed: {}", err);
                        break;
                    }
                }
            }
            trace!(consumer_tag = %consumer_tag, "exit lapin consumer forwarder");
        });
        Ok(rx)
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<()> {
        self.inner
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<()> {
        self.inner
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        let options = BasicNackOptions {
            requeue,
            ..Default::default()
        };
        self.inner.basic_nack(delivery_tag, options).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.inner
            .close(REPLY_SUCCESS, "closed by client")
            .await
            .map_err(|err| Error::ChannelCloseError(err.to_string()))
    }
}
