use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // ========== DEVICES ==========
        manager
            .create_table(
                Table::create()
                    .table(Devices::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Devices::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(Devices::DeviceKey)
                            .string_len(64)
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(Devices::Location).string_len(128))
                    .col(ColumnDef::new(Devices::Ip).string_len(64))
                    .col(
                        ColumnDef::new(Devices::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // ========== SENSORS ==========
        manager
            .create_table(
                Table::create()
                    .table(Sensors::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Sensors::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Sensors::DeviceId).integer().not_null())
                    .col(ColumnDef::new(Sensors::SensorType).string_len(32).not_null())
                    .col(ColumnDef::new(Sensors::Pin).string_len(32).not_null())
                    .col(ColumnDef::new(Sensors::Label).string_len(96))
                    .col(
                        ColumnDef::new(Sensors::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_sensors_device")
                            .from(Sensors::Table, Sensors::DeviceId)
                            .to(Devices::Table, Devices::Id),
                    )
                    .to_owned(),
            )
            .await?;

        // Natural key: concurrent resolvers race on this constraint, never on a lookup
        manager
            .create_index(
                Index::create()
                    .name("idx_sensors_device_type_pin")
                    .table(Sensors::Table)
                    .col(Sensors::DeviceId)
                    .col(Sensors::SensorType)
                    .col(Sensors::Pin)
                    .unique()
                    .if_not_exists()
                    .to_owned(),
            )
            .await?;

        // ========== READINGS ==========
        manager
            .create_table(
                Table::create()
                    .table(Readings::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Readings::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Readings::SensorId).integer().not_null())
                    .col(
                        ColumnDef::new(Readings::ReadingUuid)
                            .uuid()
                            .not_null()
                            .unique_key(),
                    )
                    .col(
                        ColumnDef::new(Readings::SampledAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(ColumnDef::new(Readings::Temperature).double().not_null())
                    .col(ColumnDef::new(Readings::Humidity).double().not_null())
                    .col(
                        ColumnDef::new(Readings::ReceivedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_readings_sensor")
                            .from(Readings::Table, Readings::SensorId)
                            .to(Sensors::Table, Sensors::Id),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_readings_sensor_sampled_at")
                    .table(Readings::Table)
                    .col(Readings::SensorId)
                    .col(Readings::SampledAt)
                    .if_not_exists()
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // Drop tables in reverse order of dependencies
        manager
            .drop_table(Table::drop().table(Readings::Table).if_exists().to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Sensors::Table).if_exists().to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Devices::Table).if_exists().to_owned())
            .await?;

        Ok(())
    }
}

#[derive(DeriveIden)]
pub enum Devices {
    Table,
    Id,
    DeviceKey,
    Location,
    Ip,
    CreatedAt,
}

#[derive(DeriveIden)]
pub enum Sensors {
    Table,
    Id,
    DeviceId,
    SensorType,
    Pin,
    Label,
    CreatedAt,
}

#[derive(DeriveIden)]
pub enum Readings {
    Table,
    Id,
    SensorId,
    ReadingUuid,
    SampledAt,
    Temperature,
    Humidity,
    ReceivedAt,
}
